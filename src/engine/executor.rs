use std::path::Path;
use std::time::Duration;

use crate::core::config::MANAGED_HEADER;
use crate::core::error::HardnError;
use crate::core::platform::{Family, PlatformInfo};
use crate::engine::framework::{
    Action, Concern, InstallMethod, ModuleResult, Probe, Step,
};
use crate::engine::framework::SkipReason;
use crate::execution::context::{CommandSpec, ExecutionContext, Owner};
use crate::execution::mutator::{
    self, MutationOutcome, MODE_SECRET, MODE_SUDOERS,
};
use crate::execution::service::ServiceController;

/// Scratch location for the visudo pre-flight check. Lives on tmpfs and the
/// dotted name keeps sudo itself from ever parsing it.
const SUDOERS_CHECK_DIR: &str = "/run/hardn";

/// Perform a module's planned steps with the uniform discipline: check each
/// step's postcondition first, back up before writing, honor dry-run, and
/// record a typed outcome for every step.
pub fn apply_steps(
    ctx: &mut dyn ExecutionContext,
    platform: &PlatformInfo,
    concern: Concern,
    steps: Vec<Step>,
) -> ModuleResult {
    let mut result = ModuleResult::new(concern);
    let mut aborted = false;

    for step in steps {
        if aborted {
            if let Some(action) = describe(&step) {
                result.skipped.push((action, SkipReason::DependencyFailed));
            }
            continue;
        }
        if let Err(fatal) = perform(ctx, platform, &step, &mut result) {
            result.errors.push(fatal);
            aborted = true;
        }
    }

    result
}

/// Record one executed action: always into `intended`, and into `performed`
/// on real runs only. The pair is what makes dry-run output comparable
/// byte-for-byte with a real run from the same starting state.
fn record(ctx: &dyn ExecutionContext, result: &mut ModuleResult, action: Action) {
    result.intended.push(action.clone());
    if !ctx.dry_run() {
        result.performed.push(action);
    }
}

fn record_backup(result: &mut ModuleResult, outcome: MutationOutcome) {
    if let Some(backup) = outcome.backup() {
        result.backups.push(backup.copy_path);
    }
}

/// Execute a single step. `Err` aborts the remaining steps of this module;
/// recoverable problems are pushed into `result.errors` and return `Ok`.
fn perform(
    ctx: &mut dyn ExecutionContext,
    platform: &PlatformInfo,
    step: &Step,
    result: &mut ModuleResult,
) -> Result<(), HardnError> {
    let changed_so_far = !result.intended.is_empty();

    match step {
        Step::EnsureDir { path, mode, owner } => {
            if ctx.stat(path).is_some_and(|i| i.is_dir) {
                result.skipped.push((
                    Action::CreatedDir(path.clone()),
                    SkipReason::AlreadyInDesiredState,
                ));
                return Ok(());
            }
            if let Err(e) = ctx.ensure_dir(path, *mode, owner.clone()) {
                result.errors.push(e);
                return Ok(());
            }
            record(ctx, result, Action::CreatedDir(path.clone()));
        }

        Step::WriteManaged {
            path,
            content,
            mode,
            owner,
            destructive_symlink,
        } => {
            let was_symlink = ctx.stat(path).is_some_and(|i| i.is_symlink);
            match mutator::write_managed_file(ctx, path, content, *mode, owner.clone()) {
                Ok(MutationOutcome::Unchanged) => {
                    result.skipped.push((
                        Action::Rewrote(path.clone()),
                        SkipReason::AlreadyInDesiredState,
                    ));
                }
                Ok(outcome) => {
                    let action = if was_symlink && *destructive_symlink {
                        Action::ReplacedSymlink(path.clone())
                    } else {
                        Action::Rewrote(path.clone())
                    };
                    record_backup(result, outcome);
                    record(ctx, result, action);
                }
                // Mutation of the primary target failed: abort the module.
                Err(e) => return Err(e),
            }
        }

        Step::ReplaceDirectives { path, directives } => {
            let mut any_changed = false;
            for (key, value) in directives {
                match mutator::replace_directive(ctx, path, key, value) {
                    Ok(MutationOutcome::Unchanged) => {}
                    Ok(outcome) => {
                        any_changed = true;
                        record_backup(result, outcome);
                    }
                    Err(e) => return Err(e),
                }
            }
            if any_changed {
                record(ctx, result, Action::Rewrote(path.clone()));
            } else {
                result.skipped.push((
                    Action::Rewrote(path.clone()),
                    SkipReason::AlreadyInDesiredState,
                ));
            }
        }

        Step::EnsureLine { path, line } => match mutator::ensure_line_in_file(ctx, path, line) {
            Ok(MutationOutcome::Unchanged) => {
                result.skipped.push((
                    Action::AppendedLine(path.clone()),
                    SkipReason::AlreadyInDesiredState,
                ));
            }
            Ok(outcome) => {
                record_backup(result, outcome);
                record(ctx, result, Action::AppendedLine(path.clone()));
            }
            Err(e) => return Err(e),
        },

        Step::Command {
            argv,
            stdin,
            timeout,
            done,
            fatal,
            only_if_changed,
        } => {
            if *only_if_changed && !changed_so_far {
                result.skipped.push((
                    Action::Ran(argv.clone()),
                    SkipReason::AlreadyInDesiredState,
                ));
                return Ok(());
            }
            if let Some(probe) = done {
                if probe_satisfied(ctx, probe) {
                    result.skipped.push((
                        Action::Ran(argv.clone()),
                        SkipReason::AlreadyInDesiredState,
                    ));
                    return Ok(());
                }
            }
            let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
            let mut spec = CommandSpec::mutating(&argv_refs);
            if let Some(bytes) = stdin {
                spec = spec.with_stdin(bytes.clone());
            }
            if let Some(t) = timeout {
                spec = spec.with_timeout(*t);
            }
            match ctx.run_command(&spec) {
                Ok(out) if out.success() => {
                    record(ctx, result, Action::Ran(argv.clone()));
                }
                Ok(out) => {
                    let err = HardnError::CommandFailed {
                        argv: argv.clone(),
                        exit: out.exit,
                        stderr: out.stderr,
                    };
                    if *fatal {
                        return Err(err);
                    }
                    result.errors.push(err);
                }
                Err(e) => {
                    if *fatal {
                        return Err(e);
                    }
                    result.errors.push(e);
                }
            }
        }

        Step::InstallPackage { name } => {
            if package_installed(ctx, platform, name) {
                result.skipped.push((
                    Action::InstalledPackage {
                        name: name.clone(),
                        method: InstallMethod::Package,
                    },
                    SkipReason::AlreadyInDesiredState,
                ));
                return Ok(());
            }
            let argv = install_argv(platform.family, name);
            let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
            match ctx.run_command(&CommandSpec::mutating(&argv_refs)) {
                Ok(out) if out.success() => {
                    record(
                        ctx,
                        result,
                        Action::InstalledPackage {
                            name: name.clone(),
                            method: InstallMethod::Package,
                        },
                    );
                }
                Ok(out) => result.errors.push(HardnError::CommandFailed {
                    argv,
                    exit: out.exit,
                    stderr: out.stderr,
                }),
                Err(e) => result.errors.push(e),
            }
        }

        Step::Service {
            logical,
            active,
            enabled,
        } => {
            let controller = ServiceController::new(platform);
            let unit = crate::execution::service::unit_name(logical, platform.family);
            match controller.converge(ctx, logical, *active, *enabled) {
                Ok(true) => record(
                    ctx,
                    result,
                    Action::ServiceConverged {
                        unit,
                        active: *active,
                        enabled: *enabled,
                    },
                ),
                Ok(false) => result.skipped.push((
                    Action::ServiceConverged {
                        unit,
                        active: *active,
                        enabled: *enabled,
                    },
                    SkipReason::AlreadyInDesiredState,
                )),
                Err(e) => result.errors.push(e),
            }
        }

        Step::RestartService {
            logical,
            only_if_changed,
        } => {
            let unit = crate::execution::service::unit_name(logical, platform.family);
            if *only_if_changed && !changed_so_far {
                result.skipped.push((
                    Action::Restarted(unit),
                    SkipReason::AlreadyInDesiredState,
                ));
                return Ok(());
            }
            let controller = ServiceController::new(platform);
            match controller.restart(ctx, logical) {
                Ok(()) => record(ctx, result, Action::Restarted(unit)),
                // File contents stay as written; the backup path already in
                // the result lets the operator restore by hand.
                Err(e) => result.errors.push(e),
            }
        }

        Step::Sudoers { path, content } => {
            let mut desired = String::new();
            desired.push_str(MANAGED_HEADER);
            desired.push('\n');
            desired.push_str(content);
            if !desired.ends_with('\n') {
                desired.push('\n');
            }
            if ctx.read_to_string(path).as_deref() == Some(desired.as_str()) {
                result.skipped.push((
                    Action::WroteSudoers(path.clone()),
                    SkipReason::AlreadyInDesiredState,
                ));
                return Ok(());
            }

            if !ctx.dry_run() {
                // Pre-flight the fragment through visudo before it can ever
                // reach /etc/sudoers.d; a rejected fragment leaves the prior
                // file untouched.
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "fragment".to_string());
                let check_dir = Path::new(SUDOERS_CHECK_DIR);
                ctx.ensure_dir(check_dir, 0o700, Owner::Root)?;
                let check_path = check_dir.join(format!("{file_name}.check"));
                ctx.write_file_atomic(&check_path, desired.as_bytes(), MODE_SECRET, Owner::Root)?;

                let check_str = check_path.to_string_lossy().to_string();
                let out = ctx.run_query(&["visudo", "-cf", &check_str])?;
                if !out.success() {
                    return Err(HardnError::CommandFailed {
                        argv: vec!["visudo".into(), "-cf".into(), check_str],
                        exit: out.exit,
                        stderr: out.stderr,
                    });
                }
            }

            match mutator::write_managed_file(ctx, path, content, MODE_SUDOERS, Owner::Root) {
                Ok(MutationOutcome::Unchanged) => {
                    result.skipped.push((
                        Action::WroteSudoers(path.clone()),
                        SkipReason::AlreadyInDesiredState,
                    ));
                }
                Ok(outcome) => {
                    record_backup(result, outcome);
                    record(ctx, result, Action::WroteSudoers(path.clone()));
                }
                Err(e) => return Err(e),
            }
        }

        Step::AuthorizedKeys {
            user,
            home,
            keys,
            replace,
        } => {
            let ssh_dir = home.join(".ssh");
            let auth_path = ssh_dir.join("authorized_keys");
            let current = ctx.read_to_string(&auth_path).unwrap_or_default();

            let mut desired_keys: Vec<String> = Vec::new();
            if !replace {
                for line in current.lines() {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() && !desired_keys.iter().any(|k| k == trimmed) {
                        desired_keys.push(trimmed.to_string());
                    }
                }
            }
            for key in keys {
                let trimmed = key.trim();
                if !desired_keys.iter().any(|k| k == trimmed) {
                    desired_keys.push(trimmed.to_string());
                }
            }

            let mut desired = desired_keys.join("\n");
            desired.push('\n');
            let mode_ok = ctx
                .stat(&auth_path)
                .is_some_and(|i| i.mode == MODE_SECRET);
            if desired == current && mode_ok {
                result.skipped.push((
                    Action::WroteAuthorizedKeys(auth_path),
                    SkipReason::AlreadyInDesiredState,
                ));
                return Ok(());
            }

            ctx.ensure_dir(&ssh_dir, 0o700, Owner::User(user.clone()))?;
            let record_backup_outcome = ctx.write_file_atomic(
                &auth_path,
                desired.as_bytes(),
                MODE_SECRET,
                Owner::User(user.clone()),
            )?;
            if !record_backup_outcome.copy_path.as_os_str().is_empty() {
                result.backups.push(record_backup_outcome.copy_path);
            }
            record(ctx, result, Action::WroteAuthorizedKeys(auth_path));
        }

        Step::RefreshPackageIndex { only_if_changed } => {
            if *only_if_changed && !changed_so_far {
                result.skipped.push((
                    Action::RefreshedPackageIndex,
                    SkipReason::AlreadyInDesiredState,
                ));
                return Ok(());
            }
            let argv: Vec<String> = match platform.family {
                Family::Alpine => vec!["apk".into(), "update".into()],
                _ => vec!["apt-get".into(), "update".into()],
            };
            let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
            let spec = CommandSpec::mutating(&argv_refs)
                .with_timeout(Duration::from_secs(300));
            match ctx.run_command(&spec) {
                Ok(out) if out.success() => record(ctx, result, Action::RefreshedPackageIndex),
                Ok(out) => result.errors.push(HardnError::CommandFailed {
                    argv,
                    exit: out.exit,
                    stderr: out.stderr,
                }),
                Err(e) => result.errors.push(e),
            }
        }
    }

    Ok(())
}

/// What a step would do, for skip bookkeeping after an abort.
fn describe(step: &Step) -> Option<Action> {
    match step {
        Step::EnsureDir { path, .. } => Some(Action::CreatedDir(path.clone())),
        Step::WriteManaged { path, .. } => Some(Action::Rewrote(path.clone())),
        Step::ReplaceDirectives { path, .. } => Some(Action::Rewrote(path.clone())),
        Step::EnsureLine { path, .. } => Some(Action::AppendedLine(path.clone())),
        Step::Command { argv, .. } => Some(Action::Ran(argv.clone())),
        Step::InstallPackage { name } => Some(Action::InstalledPackage {
            name: name.clone(),
            method: InstallMethod::Package,
        }),
        Step::Service {
            logical,
            active,
            enabled,
        } => Some(Action::ServiceConverged {
            unit: logical.clone(),
            active: *active,
            enabled: *enabled,
        }),
        Step::RestartService { logical, .. } => Some(Action::Restarted(logical.clone())),
        Step::Sudoers { path, .. } => Some(Action::WroteSudoers(path.clone())),
        Step::AuthorizedKeys { home, .. } => Some(Action::WroteAuthorizedKeys(
            home.join(".ssh").join("authorized_keys"),
        )),
        Step::RefreshPackageIndex { .. } => Some(Action::RefreshedPackageIndex),
    }
}

/// Evaluate a typed postcondition against live host state.
pub fn probe_satisfied(ctx: &mut dyn ExecutionContext, probe: &Probe) -> bool {
    match probe {
        Probe::UserExists(name) => ctx
            .read_to_string("/etc/passwd".as_ref())
            .is_some_and(|passwd| {
                passwd
                    .lines()
                    .any(|l| l.split(':').next() == Some(name.as_str()))
            }),
        Probe::UserInGroup { user, group } => ctx
            .read_to_string("/etc/group".as_ref())
            .is_some_and(|groups| {
                groups.lines().any(|l| {
                    let mut fields = l.split(':');
                    fields.next() == Some(group.as_str())
                        && fields
                            .nth(2)
                            .is_some_and(|members| members.split(',').any(|m| m == user))
                })
            }),
        Probe::FirewallActive => {
            ufw_status(ctx).is_some_and(|s| s.contains("Status: active"))
        }
        Probe::FirewallDefaultDeny => {
            ufw_status(ctx).is_some_and(|s| s.contains("deny (incoming)"))
        }
        Probe::FirewallOutboundAllow => {
            ufw_status(ctx).is_some_and(|s| s.contains("allow (outgoing)"))
        }
        Probe::FirewallRuleExists(rule) => ufw_status(ctx).is_some_and(|s| {
            s.lines()
                .any(|l| l.split_whitespace().next() == Some(rule.as_str()))
        }),
    }
}

fn ufw_status(ctx: &mut dyn ExecutionContext) -> Option<String> {
    ctx.run_query(&["ufw", "status", "verbose"])
        .ok()
        .filter(|o| o.success())
        .map(|o| o.stdout)
}

/// Whether `name` is installed, via the platform's package database.
pub fn package_installed(
    ctx: &mut dyn ExecutionContext,
    platform: &PlatformInfo,
    name: &str,
) -> bool {
    match platform.family {
        Family::Alpine => ctx
            .run_query(&["apk", "info", "-e", name])
            .is_ok_and(|o| o.success()),
        _ => ctx
            .run_query(&["dpkg-query", "-W", "-f", "${Status}", name])
            .is_ok_and(|o| o.success() && o.stdout.contains("install ok installed")),
    }
}

fn install_argv(family: Family, name: &str) -> Vec<String> {
    match family {
        Family::Alpine => vec!["apk".into(), "add".into(), name.into()],
        _ => vec!["apt-get".into(), "install".into(), "-y".into(), name.into()],
    }
}
