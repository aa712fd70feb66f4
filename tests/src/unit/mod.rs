mod flow_tests;
mod restart_tests;
