pub mod commands;
pub mod output;

pub use commands::{
    Backend, CheckReport, StageOptions, StageOutput, check_command, connect, route_command,
    run_command, stage_command,
};
