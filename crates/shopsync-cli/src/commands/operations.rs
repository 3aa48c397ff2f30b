use shopsync_core::models::OperationId;

use crate::commands::common::{format_operation_lines, Session};
use crate::error::CliError;

pub fn run_failed(session: &Session, as_json: bool) -> Result<(), CliError> {
    let operations = session.context.failed_operations()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&operations)?);
        return Ok(());
    }

    if operations.is_empty() {
        println!("No failed operations.");
        return Ok(());
    }
    for line in format_operation_lines(&operations) {
        println!("{line}");
    }
    Ok(())
}

pub fn run_retry(session: &Session, op_id: &str) -> Result<(), CliError> {
    let op_id: OperationId = op_id.parse()?;
    let op = session.context.retry_failed_operation(&op_id)?;
    println!(
        "Requeued {} {}/{}",
        op.kind, op.entity_type, op.entity_id
    );
    Ok(())
}
