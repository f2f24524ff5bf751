//! Run and submit command implementations for moor CLI.

use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use moor_core::{
    ExecuteResult, ExecutionSession, FragmentType, Host, HostConfig, LaunchCommand, LocalOptions,
    StatementStatus,
};
use tracing::info;

use crate::SessionArgs;
use crate::colors;

/// Parse a `KEY=VALUE` argument.
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in {s:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Load the host configuration: file (if any), then `MOOR_*` overrides.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<HostConfig> {
    let config = match path {
        Some(path) => HostConfig::from_file(path)?,
        None => HostConfig::default(),
    };
    Ok(config.apply_env()?)
}

/// Execute statements in order.
pub async fn execute(
    config: HostConfig,
    args: &SessionArgs,
    statements: &[String],
) -> anyhow::Result<()> {
    let (host, session) = open_session(config, args).await?;
    let options: LocalOptions = args.options.iter().cloned().collect();

    let work = async {
        let mut unfinished = 0;
        for statement in statements {
            let code = read_statement(statement)?;
            let result = session.execute(code, options.clone()).await?;
            if result.status != StatementStatus::Finished {
                unfinished += 1;
            }
            print_result(&result, args.json)?;
        }
        anyhow::Ok(unfinished)
    };
    let outcome = until_interrupted(work).await;
    close(&host, &session).await;

    let unfinished = outcome?;
    if unfinished > 0 {
        bail!("{unfinished} statement(s) did not finish");
    }
    Ok(())
}

/// Submit one statement, optionally cancel it, and wait for it.
pub async fn submit(
    config: HostConfig,
    args: &SessionArgs,
    statement: &str,
    cancel_after_ms: Option<u64>,
) -> anyhow::Result<()> {
    let (host, session) = open_session(config, args).await?;
    let options: LocalOptions = args.options.iter().cloned().collect();

    let work = async {
        let code = read_statement(statement)?;
        let submitted = session.submit(code, options)?;
        let id = submitted.statement_id;
        eprintln!("{}submitted {}{}", colors::DIM, id, colors::RESET);

        if let Some(ms) = cancel_after_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            info!(statement_id = %id, "cancelling");
            session.cancel(&id).await?;
        }
        let result = session.wait_until_finished(&id).await?;
        print_result(&result, args.json)?;
        anyhow::Ok(())
    };
    let outcome = until_interrupted(work).await;
    close(&host, &session).await;
    outcome
}

async fn open_session(
    mut config: HostConfig,
    args: &SessionArgs,
) -> anyhow::Result<(Host, ExecutionSession)> {
    if let Some(remote) = &args.remote_host {
        config.remote_host = Some(remote.clone());
    }
    let host = Host::start(config).await?;

    let mut builder = host
        .session(&args.interpreter)
        .properties(args.properties.iter().cloned());
    if let Some(user) = &args.user {
        builder = builder.user(user);
    }
    if let Some(runner) = &args.runner {
        builder = builder.runner(LaunchCommand::new(runner.display().to_string()));
    }
    let session = builder.build()?;

    let start = Instant::now();
    if let Err(e) = session.start().await {
        host.shutdown().await;
        return Err(e.into());
    }
    eprintln!(
        "{}{}{} worker {} ready in {:.2}s",
        colors::BOLD,
        args.interpreter,
        colors::RESET,
        session.handle().group_id(),
        start.elapsed().as_secs_f64()
    );
    if let Some(url) = session.web_url() {
        eprintln!("web ui: {url}");
    }
    Ok((host, session))
}

async fn close(host: &Host, session: &ExecutionSession) {
    session.stop().await;
    host.shutdown().await;
}

async fn until_interrupted<T>(
    work: impl std::future::Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    tokio::select! {
        result = work => result,
        _ = tokio::signal::ctrl_c() => bail!("interrupted"),
    }
}

fn read_statement(arg: &str) -> anyhow::Result<String> {
    if arg != "-" {
        return Ok(arg.to_string());
    }
    let mut code = String::new();
    std::io::stdin()
        .read_to_string(&mut code)
        .context("failed to read statement from stdin")?;
    Ok(code)
}

fn print_result(result: &ExecuteResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }

    let color = match result.status {
        StatementStatus::Finished => colors::GREEN,
        StatementStatus::Error => colors::RED,
        _ => colors::YELLOW,
    };
    println!(
        "{}{}[{}]{} {}",
        colors::BOLD,
        color,
        result.status,
        colors::RESET,
        result.statement_id
    );
    for fragment in &result.results {
        if fragment.kind != FragmentType::Text {
            println!("{}%{}{}", colors::DIM, fragment.kind, colors::RESET);
        }
        print!("{}", fragment.data);
        if !fragment.data.ends_with('\n') {
            println!();
        }
    }
    for url in &result.job_urls {
        println!("{}job:{} {}", colors::DIM, colors::RESET, url);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("type=single"),
            Ok(("type".to_string(), "single".to_string()))
        );
        assert_eq!(
            parse_key_value("JAVA_OPTS=-Dx=1"),
            Ok(("JAVA_OPTS".to_string(), "-Dx=1".to_string()))
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_missing_config_file_is_error() {
        assert!(load_config(Some(Path::new("/nonexistent/moor.json"))).is_err());
    }
}
