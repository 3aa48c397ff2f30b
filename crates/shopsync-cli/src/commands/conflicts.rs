use shopsync_core::models::ConflictId;

use crate::cli::ChoiceArg;
use crate::commands::common::{format_conflict_lines, parse_payload, Session};
use crate::error::CliError;

pub fn run_conflicts(session: &Session, as_json: bool) -> Result<(), CliError> {
    let conflicts = session.context.get_pending_conflicts()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No open conflicts.");
        return Ok(());
    }
    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub fn run_resolve(
    session: &Session,
    conflict_id: &str,
    choice: ChoiceArg,
    data: Option<&str>,
) -> Result<(), CliError> {
    let conflict_id: ConflictId = conflict_id.parse()?;
    let custom_payload = data
        .map(|raw| parse_payload(raw, "--data"))
        .transpose()?;

    let entity = session.context.resolve_conflict_manually(
        &conflict_id,
        choice.into(),
        custom_payload,
    )?;
    println!(
        "Resolved {}/{} ({})",
        entity.entity_type,
        entity.id,
        entity.sync_state.as_str()
    );
    Ok(())
}
