//! Outbound device commands

pub mod handler;

pub use handler::{
    plan_command, BulkCommandRequest, BulkCommandResponse, BulkCommandResult, BulkStatus,
    BulkSummary, CommandHandler, CommandPlan, CommandRequest, CommandResponse, CommandType,
};
