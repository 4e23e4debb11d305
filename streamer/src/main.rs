//! Streamer binary: drives a synthetic test run against a collector

use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use url::Url;
use uuid::Uuid;

use shared::{AttachmentPayload, LogLevel, TestStatus};
use streamer::{CaseOutcome, Config, ConfigResolver, EventSink, LogRecord, ProcessEnvironment, StreamingClient};

#[derive(Parser)]
#[command(name = "streamer")]
#[command(about = "Stream a synthetic test run to a TestRift collector")]
struct Args {
    /// Collector URL; overrides the config file
    #[arg(long)]
    server_url: Option<Url>,

    /// Run name; overrides the config file
    #[arg(long)]
    run_name: Option<String>,

    /// Number of suites to simulate
    #[arg(long, default_value_t = 2)]
    suites: usize,

    /// Cases per suite
    #[arg(long, default_value_t = 3)]
    cases: usize,

    /// Fail every n-th case (0 disables failures)
    #[arg(long, default_value_t = 3)]
    fail_every: usize,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.server_url {
        Some(url) => Config::new(url.clone()).context("invalid --server-url")?,
        None => ConfigResolver::from_current_dir()
            .resolve(&ProcessEnvironment)
            .context("failed to resolve streaming config")?,
    };
    if let Some(run_name) = &args.run_name {
        config.run_name = run_name.clone();
    }
    Ok(config)
}

fn simulate_run(client: &StreamingClient, args: &Args) -> anyhow::Result<TestStatus> {
    let mut overall = TestStatus::Passed;
    let mut case_number = 0;

    client.on_run_start()?;
    client.on_log(None, LogRecord::info("synthetic run started").with_component("streamer"))?;

    for suite_index in 0..args.suites {
        let suite_id = Uuid::new_v4().to_string();
        let suite_started = Instant::now();
        let mut suite_status = TestStatus::Passed;
        client.on_suite_start(&suite_id, &format!("Suite{}", suite_index + 1), None)?;

        for case_index in 0..args.cases {
            case_number += 1;
            let case_id = Uuid::new_v4().to_string();
            let case_started = Instant::now();
            client.on_case_start(&case_id, &suite_id, &format!("Case{}", case_index + 1))?;
            client.on_log(
                Some(&case_id),
                LogRecord::new(LogLevel::Debug, format!("executing case {}", case_number))
                    .with_component("dut")
                    .with_channel("console"),
            )?;
            std::thread::sleep(Duration::from_millis(5));

            let outcome = if args.fail_every > 0 && case_number % args.fail_every == 0 {
                client.on_attachment(
                    Some(&case_id),
                    "failure.txt",
                    "text/plain",
                    AttachmentPayload::Inline {
                        data: format!("case {} failed", case_number).into_bytes(),
                    },
                )?;
                suite_status = TestStatus::Failed;
                CaseOutcome::failed(
                    case_started.elapsed(),
                    format!("expected 1 but was {}", case_number),
                    Some(format!("at Suite{}.Case{}()", suite_index + 1, case_index + 1)),
                )
            } else {
                CaseOutcome::passed(case_started.elapsed())
            };
            client.on_case_finish(&case_id, outcome)?;
        }

        client.on_suite_finish(&suite_id, suite_status, suite_started.elapsed())?;
        if suite_status == TestStatus::Failed {
            overall = TestStatus::Failed;
        }
    }

    Ok(overall)
}

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    shared::logging::init_tracing(Some(&args.log_level));

    let config = load_config(&args)?;
    println!("Streaming run '{}' to {}", config.run_name, config.endpoint);

    let client = StreamingClient::init(config)?;
    client.install_shutdown_hook()?;

    let overall = simulate_run(&client, &args)?;
    let report = client.on_run_finish(overall)?;
    let status = client.status();

    println!("Run finished: {}", overall);
    println!("  delivered: {}, undelivered: {}", report.delivered, report.dropped);
    println!("  flush timed out: {}, close confirmed: {}", report.flush_timed_out, report.close_confirmed);
    if let Some(run_url) = &status.run_url {
        println!("  run url: {}", run_url);
    }
    if let Some(error) = &status.terminal_error {
        println!("  streaming stopped early: {}", error);
    }
    for warning in &status.warnings {
        println!("  warning: {}", warning);
    }

    Ok(())
}
