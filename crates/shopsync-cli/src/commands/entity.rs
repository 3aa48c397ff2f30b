use shopsync_core::models::{EntityId, EntityType, OperationKind, Payload};

use crate::commands::common::{format_entity_lines, parse_payload, Session};
use crate::error::CliError;

pub fn run_create(
    session: &Session,
    entity_type: &str,
    id: Option<&str>,
    data: &str,
) -> Result<(), CliError> {
    let entity_type: EntityType = entity_type.parse()?;
    let id = match id {
        Some(id) => id.parse()?,
        None => EntityId::generate(),
    };
    let payload = parse_payload(data, "--data")?;

    session
        .context
        .enqueue_change(entity_type, &id, OperationKind::Create, payload)?;
    println!("{id}");
    Ok(())
}

pub fn run_update(
    session: &Session,
    entity_type: &str,
    id: &str,
    data: &str,
) -> Result<(), CliError> {
    let payload = parse_payload(data, "--data")?;
    enqueue(session, entity_type, id, OperationKind::Update, payload)
}

pub fn run_delete(session: &Session, entity_type: &str, id: &str) -> Result<(), CliError> {
    enqueue(session, entity_type, id, OperationKind::Delete, Payload::new())
}

fn enqueue(
    session: &Session,
    entity_type: &str,
    id: &str,
    kind: OperationKind,
    payload: Payload,
) -> Result<(), CliError> {
    let entity_type: EntityType = entity_type.parse()?;
    let id: EntityId = id.parse()?;
    let op_id = session
        .context
        .enqueue_change(entity_type, &id, kind, payload)?;
    println!("Queued {kind} {entity_type}/{id} as {op_id}");
    Ok(())
}

pub fn run_get(
    session: &Session,
    entity_type: &str,
    id: &str,
    as_json: bool,
) -> Result<(), CliError> {
    let entity_type: EntityType = entity_type.parse()?;
    let id: EntityId = id.parse()?;
    let entity = session
        .context
        .get_entity(entity_type, &id)
        .ok_or_else(|| CliError::EntityNotFound(format!("{entity_type}/{id}")))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entity)?);
        return Ok(());
    }

    println!("{}/{}", entity.entity_type, entity.id);
    println!("state:   {}", entity.sync_state.as_str());
    println!("version: {}", entity.version);
    println!(
        "remote:  {}",
        entity
            .remote_version
            .map_or_else(|| "-".to_string(), |version| version.to_string())
    );
    println!("origin:  {}", entity.origin.as_str());
    println!("{}", serde_json::to_string_pretty(&entity.payload)?);
    Ok(())
}

pub fn run_list(session: &Session, entity_type: &str, as_json: bool) -> Result<(), CliError> {
    let entity_type: EntityType = entity_type.parse()?;
    let entities = session.context.snapshot(entity_type);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entities)?);
        return Ok(());
    }

    if entities.is_empty() {
        println!("No {entity_type} entities stored.");
        return Ok(());
    }
    for line in format_entity_lines(&entities) {
        println!("{line}");
    }
    Ok(())
}
