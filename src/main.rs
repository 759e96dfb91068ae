use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;

use hardn::cli::{render_results, render_status, Cli, Command};
use hardn::core::config::{self, EXIT_NEEDS_ROOT, EXIT_SUCCESS, EXIT_USAGE};
use hardn::core::plan::HardeningPlan;
use hardn::core::platform::PlatformInfo;
use hardn::engine::framework::{Concern, Step};
use hardn::engine::{executor, risk, HardeningEngine};
use hardn::execution::context::ExecutionContext;
use hardn::execution::host::{running_as_root, HostContext};
use hardn::utils::{log_message, LogLevel, Logger};

static CANCEL: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_signal: libc::c_int) {
    CANCEL.store(true, Ordering::Relaxed);
}

fn main() {
    let cli = Cli::parse();

    if !running_as_root() {
        log_message(LogLevel::Error, "hardn must be run as root");
        process::exit(EXIT_NEEDS_ROOT);
    }

    // Cancellation is honored between modules only; mid-module work runs to
    // its own timeout.
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
    }

    let plan = match load_plan(&cli) {
        Ok(plan) => plan,
        Err(e) => {
            log_message(LogLevel::Error, &e.to_string());
            process::exit(e.exit_code());
        }
    };

    let code = match cli.command {
        Command::Audit => run_audit(&plan),
        Command::Apply { dry_run } => run_apply(&plan, dry_run),
        Command::SetupSudoEnv => run_setup_sudo_env(&plan),
    };
    process::exit(code);
}

/// An explicit config (flag or HARDN_CONFIG) must load; with neither, the
/// defaults-only plan still allows `audit` and `setup-sudo-env`.
fn load_plan(cli: &Cli) -> hardn::core::error::HardnResult<HardeningPlan> {
    match config::config_path(cli.config.as_deref()) {
        Some(path) => config::load_plan(&path),
        None => Ok(HardeningPlan::default()),
    }
}

fn build_context(plan: &HardeningPlan, dry_run: bool) -> HostContext {
    HostContext::new(plan.global.backup_root.clone(), dry_run)
}

fn run_audit(plan: &HardeningPlan) -> i32 {
    let mut ctx = build_context(plan, false);
    let platform = PlatformInfo::probe(&mut ctx);
    let engine = HardeningEngine::new(platform);

    let status = engine.audit(&mut ctx);
    let assessment = risk::score(&status, engine.platform().family);
    let subnets = ctx.local_subnets();
    render_status(engine.platform(), &status, &assessment, &subnets);
    EXIT_SUCCESS
}

fn run_apply(plan: &HardeningPlan, dry_run_flag: bool) -> i32 {
    let dry_run = dry_run_flag || plan.global.dry_run;
    let mut ctx = build_context(plan, dry_run);
    let platform = PlatformInfo::probe(&mut ctx);
    let engine = HardeningEngine::new(platform);
    let mut logger = Logger::new(plan.global.log_file.clone());

    if dry_run {
        log_message(LogLevel::Info, "dry run: no host state will change");
    }

    match engine.run(&mut ctx, plan, &CANCEL, &mut logger) {
        Ok(report) => {
            render_results(&report.results);
            render_status(
                engine.platform(),
                &report.status,
                &report.risk,
                &ctx.local_subnets(),
            );
            if report.cancelled {
                log_message(
                    LogLevel::Warning,
                    &format!(
                        "cancelled; backups so far under {}",
                        report.backup_root.display()
                    ),
                );
            }
            report.exit_code()
        }
        Err(e) => {
            log_message(LogLevel::Error, &e.to_string());
            log_message(
                LogLevel::Warning,
                &format!("backups (if any) under {}", plan.global.backup_root.display()),
            );
            e.exit_code()
        }
    }
}

/// Install `/etc/sudoers.d/hardn-env` so sudo preserves HARDN_CONFIG, going
/// through the same visudo-gated step the user module uses.
fn run_setup_sudo_env(plan: &HardeningPlan) -> i32 {
    let mut ctx = build_context(plan, false);
    let platform = PlatformInfo::probe(&mut ctx);

    let step = Step::Sudoers {
        path: PathBuf::from("/etc/sudoers.d/hardn-env"),
        content: "Defaults env_keep += \"HARDN_CONFIG\"".to_string(),
    };
    let result = executor::apply_steps(&mut ctx, &platform, Concern::User, vec![step]);
    render_results(std::slice::from_ref(&result));
    if !result.errors.is_empty() {
        log_message(LogLevel::Error, "sudoers fragment rejected; nothing installed");
        return EXIT_USAGE;
    }
    EXIT_SUCCESS
}
