use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use crate::config::{Config, SandboxConfig};
use crate::sandbox::{
    IsolationMode, PlatformInfo, Sandbox, SandboxError, get_platform_info, run_captured,
};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Print machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    platform: PlatformInfo,
    config_file: PathBuf,
    sandbox: &'a SandboxConfig,
    effective: Option<Effective>,
    error: Option<String>,
}

#[derive(Serialize)]
struct Effective {
    backend: &'static str,
    work_dir: PathBuf,
    tmp_dir: PathBuf,
    writable_dirs: Vec<PathBuf>,
}

pub async fn run_status(args: StatusArgs, config: &Config) -> Result<()> {
    let platform = get_platform_info();
    let (effective, error) = match Sandbox::new(config.sandbox.to_sandbox_config()) {
        Ok(sandbox) => (
            Some(Effective {
                backend: sandbox.backend_name(),
                work_dir: sandbox.get_work_dir(),
                tmp_dir: sandbox.get_tmp_dir(),
                writable_dirs: sandbox.get_writable_dirs(),
            }),
            None,
        ),
        Err(e) => (None, Some(e.to_string())),
    };

    let report = StatusReport {
        platform,
        config_file: config.config_path(),
        sandbox: &config.sandbox,
        effective,
        error,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Sandbox Capabilities:");
    for line in report.platform.status_lines() {
        println!("{}", line);
    }
    println!();

    let sandbox = &config.sandbox;
    println!("Configuration ({}):", report.config_file.display());
    println!("  Mode:        {}", sandbox.isolation_mode);
    println!("  Timeout:     {}s", sandbox.timeout_secs);
    println!("  Max output:  {} bytes", sandbox.max_output_bytes);
    println!("  State dir:   {}", sandbox.state_dir_name);
    if !sandbox.env.is_empty() {
        println!("  Env:         {} entries", sandbox.env.len());
    }

    match (&report.effective, &report.error) {
        (Some(effective), _) => {
            println!("  Backend:     {}", effective.backend);
            println!("  Work dir:    {}", effective.work_dir.display());
            println!("  Tmp dir:     {}", effective.tmp_dir.display());
            for dir in &effective.writable_dirs {
                println!("  Writable:    {}", dir.display());
            }
        }
        (None, Some(error)) => println!("  Invalid:     {}", error),
        (None, None) => {}
    }

    Ok(())
}

/// Shell invocation for a one-line script on this platform.
fn shell(script: &str) -> (String, Vec<String>) {
    if cfg!(windows) {
        (
            "cmd".to_string(),
            vec!["/D".to_string(), "/C".to_string(), script.to_string()],
        )
    } else {
        ("sh".to_string(), vec!["-c".to_string(), script.to_string()])
    }
}

fn sleep_command(secs: u64) -> (String, Vec<String>) {
    if cfg!(windows) {
        shell(&format!("ping -n {} 127.0.0.1 > NUL", secs + 1))
    } else {
        ("sleep".to_string(), vec![secs.to_string()])
    }
}

fn report(passed: &mut u32, failed: &mut u32, outcome: std::result::Result<String, String>) {
    match outcome {
        Ok(msg) => {
            println!("{}", msg);
            *passed += 1;
        }
        Err(msg) => {
            println!("FAIL ({})", msg);
            *failed += 1;
        }
    }
}

pub async fn run_test(config: &Config) -> Result<()> {
    let platform = get_platform_info();
    let mut sandbox_config = config.sandbox.to_sandbox_config();
    if sandbox_config.isolation_mode != IsolationMode::Os {
        println!(
            "Isolation mode is '{}'; smoke tests run in 'os' mode.",
            sandbox_config.isolation_mode
        );
        sandbox_config.isolation_mode = IsolationMode::Os;
    }

    let workspace = tempfile::tempdir()?;
    sandbox_config.work_dir = Some(workspace.path().to_path_buf());
    sandbox_config.writable_dirs = vec![workspace.path().to_path_buf()];
    sandbox_config.timeout = Duration::ZERO;
    let sandbox = Sandbox::new(sandbox_config)?;
    let max_output = config.sandbox.max_output_bytes;

    println!("Running sandbox smoke tests...");
    println!("  Workspace: {}", sandbox.get_work_dir().display());
    println!("  Backend:   {} ({})", sandbox.backend_name(), platform.isolation);
    println!();

    let mut passed = 0;
    let mut failed = 0;

    // Test 1: Echo command succeeds
    print!("  [1/4] Echo command succeeds:        ");
    let (name, args) = shell("echo hello");
    let outcome = match run_captured(&sandbox, &name, &args, max_output).await {
        Ok(out) if out.success() && out.stdout.contains("hello") => Ok("ok".to_string()),
        Ok(out) => Err(format!(
            "exit={}, output={}",
            out.exit_code,
            out.combined().chars().take(100).collect::<String>()
        )),
        Err(e) => Err(e.to_string()),
    };
    report(&mut passed, &mut failed, outcome);

    // Test 2: Write outside the writable directories is denied
    print!("  [2/4] Write outside writable dirs:  ");
    let outside = outside_test_path();
    let (name, args) = if cfg!(windows) {
        shell(&format!("echo x > \"{}\"", outside.display()))
    } else {
        shell(&format!("touch '{}'", outside.display()))
    };
    let outcome = if sandbox.is_path_writable(&outside) {
        Err(format!("{} is inside a writable dir", outside.display()))
    } else {
        match run_captured(&sandbox, &name, &args, max_output).await {
            Ok(out) if !out.success() => Ok("denied (ok)".to_string()),
            Ok(_) => {
                let _ = std::fs::remove_file(&outside);
                Err("write succeeded".to_string())
            }
            Err(e) => Err(e.to_string()),
        }
    };
    report(&mut passed, &mut failed, outcome);

    // Test 3: Timeout enforcement
    print!("  [3/4] Timeout enforcement:          ");
    let (name, args) = sleep_command(30);
    let outcome = match sandbox.execute(&name, &args) {
        Ok(mut command) => {
            let token = command.cancel_token();
            let started = Instant::now();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                token.cancel();
            });
            let result = command.run().await;
            timer.abort();
            match result {
                Err(SandboxError::Cancelled) if started.elapsed() < Duration::from_secs(10) => Ok(
                    format!("killed after {:.1}s (ok)", started.elapsed().as_secs_f64()),
                ),
                Err(SandboxError::Cancelled) => Err("kill took too long".to_string()),
                Ok(()) => Err("command was not killed".to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        Err(e) => Err(e.to_string()),
    };
    report(&mut passed, &mut failed, outcome);

    // Test 4: Concurrent commands do not interfere
    print!("  [4/4] Concurrent isolation:         ");
    let (name_a, args_a) = shell("echo first");
    let (name_b, args_b) = shell("echo second");
    let (a, b) = tokio::join!(
        run_captured(&sandbox, &name_a, &args_a, max_output),
        run_captured(&sandbox, &name_b, &args_b, max_output),
    );
    let outcome = match (a, b) {
        (Ok(a), Ok(b))
            if a.stdout.contains("first")
                && !a.stdout.contains("second")
                && b.stdout.contains("second")
                && !b.stdout.contains("first") =>
        {
            Ok("ok".to_string())
        }
        (Ok(_), Ok(_)) => Err("outputs were mixed".to_string()),
        (Err(e), _) | (_, Err(e)) => Err(e.to_string()),
    };
    report(&mut passed, &mut failed, outcome);

    println!();
    if failed == 0 {
        println!("All {} tests passed.", passed);
    } else {
        println!("{} passed, {} failed.", passed, failed);
    }

    Ok(())
}

/// A file in a directory that is never granted to sandboxed commands.
fn outside_test_path() -> PathBuf {
    let name = format!("agent-sandbox-smoke-{}", std::process::id());
    if cfg!(windows) {
        PathBuf::from(std::env::var("SystemRoot").unwrap_or_else(|_| r"C:\Windows".into()))
            .join(name)
    } else {
        PathBuf::from("/").join(name)
    }
}
