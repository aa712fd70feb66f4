pub mod cli_state;
pub mod render;

pub use cli_state::{load_cli_state, save_cli_state, state_root, CliState};
pub use render::{message_block, report_outcome, session_line, DraftPrinter};
