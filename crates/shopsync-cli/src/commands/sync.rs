use shopsync_core::sync::SyncOutcome;
use tokio::sync::watch;

use crate::commands::common::{format_report_line, format_statistics_lines, Session};
use crate::error::CliError;

pub async fn run_sync(session: &Session, keep_watching: bool, as_json: bool) -> Result<(), CliError> {
    if !session.remote_configured {
        return Err(CliError::SyncNotConfigured);
    }
    let context = &session.context;
    context.set_online(true);

    if keep_watching {
        let (connectivity, signal) = watch::channel(true);
        println!("Syncing until interrupted (Ctrl-C to stop)");
        tokio::select! {
            () = context.run(signal) => {}
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Interrupted; stopping sync loop");
            }
        }
        drop(connectivity);
        return Ok(());
    }

    match context.sync_now().await? {
        SyncOutcome::Completed(report) => {
            if as_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", format_report_line(&report));
            }
            Ok(())
        }
        SyncOutcome::Aborted { reason, .. } => Err(CliError::SyncAborted(reason)),
        SyncOutcome::AlreadyRunning => {
            println!("A sync pass is already running");
            Ok(())
        }
        SyncOutcome::Offline => {
            println!("Offline; nothing synced");
            Ok(())
        }
    }
}

pub fn run_stats(session: &Session, as_json: bool) -> Result<(), CliError> {
    let stats = session.context.get_sync_statistics();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    for line in format_statistics_lines(&stats) {
        println!("{line}");
    }
    Ok(())
}
