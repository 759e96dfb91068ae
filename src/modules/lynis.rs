use std::path::Path;
use std::time::Duration;

use crate::core::error::{HardnError, HardnResult};
use crate::core::plan::HardeningPlan;
use crate::core::platform::{Family, PlatformInfo};
use crate::core::status::TriState;
use crate::engine::executor::package_installed;
use crate::engine::framework::{
    Action, Concern, ConcernModule, InstallMethod, ModuleResult, ModuleState, SkipReason, Step,
    ToolState,
};
use crate::execution::context::{CommandSpec, ExecutionContext};

/// Where the tarball fallback unpacks to.
pub const TARBALL_INSTALL_DIR: &str = "/usr/local/lynis";
const TARBALL_URL: &str = "https://downloads.cisofy.com/lynis/lynis-3.1.1.tar.gz";
const TARBALL_TMP: &str = "/tmp/lynis.tar.gz";

/// Lynis system auditing. Installed from the distro repo where possible,
/// from the upstream tarball otherwise; the chosen method is recorded in
/// the result. Audit runs are informational and never fail the module.
pub struct LynisModule;

impl LynisModule {
    fn installed(ctx: &mut dyn ExecutionContext, platform: &PlatformInfo) -> bool {
        package_installed(ctx, platform, "lynis")
            || ctx.stat(Path::new(TARBALL_INSTALL_DIR)).is_some()
    }
}

impl ConcernModule for LynisModule {
    fn concern(&self) -> Concern {
        Concern::Lynis
    }

    fn audit(
        &self,
        ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
    ) -> HardnResult<ModuleState> {
        Ok(ModuleState::Tool(ToolState {
            installed: Self::installed(ctx, platform),
            active: TriState::Unknown,
            enabled: TriState::Unknown,
        }))
    }

    fn plan(
        &self,
        _ctx: &mut dyn ExecutionContext,
        _platform: &PlatformInfo,
        plan: &HardeningPlan,
        _state: &ModuleState,
    ) -> HardnResult<Vec<Step>> {
        let Some(lynis) = &plan.lynis else {
            return Ok(Vec::new());
        };
        if !lynis.enable {
            return Ok(Vec::new());
        }

        let mut steps = vec![Step::InstallPackage {
            name: "lynis".to_string(),
        }];
        if lynis.run_audit_after_install {
            steps.push(Step::Command {
                argv: vec![
                    "lynis".into(),
                    "audit".into(),
                    "system".into(),
                    "--quick".into(),
                ],
                stdin: None,
                timeout: Some(Duration::from_secs(600)),
                done: None,
                fatal: false,
                only_if_changed: false,
            });
        }
        Ok(steps)
    }

    /// Custom apply: the package attempt may legitimately fail on distros
    /// whose repos lack lynis, in which case the upstream tarball is used
    /// instead, and the audit command's exit code is informational.
    fn apply(
        &self,
        ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
        steps: Vec<Step>,
    ) -> ModuleResult {
        let mut result = ModuleResult::new(Concern::Lynis);

        for step in steps {
            match step {
                Step::InstallPackage { name } => {
                    if Self::installed(ctx, platform) {
                        result.skipped.push((
                            Action::InstalledPackage {
                                name,
                                method: InstallMethod::Package,
                            },
                            SkipReason::AlreadyInDesiredState,
                        ));
                        continue;
                    }
                    install_with_fallback(ctx, platform, &name, &mut result);
                }
                Step::Command { argv, timeout, .. } => {
                    let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
                    let mut spec = CommandSpec::mutating(&argv_refs);
                    if let Some(t) = timeout {
                        spec = spec.with_timeout(t);
                    }
                    match ctx.run_command(&spec) {
                        // Lynis exit codes carry findings, not failure.
                        Ok(_) => {
                            result.intended.push(Action::Ran(argv.clone()));
                            if !ctx.dry_run() {
                                result.performed.push(Action::Ran(argv));
                            }
                        }
                        Err(e) => result.errors.push(e),
                    }
                }
                // No other step kinds are planned for this concern.
                _ => {}
            }
        }

        result
    }
}

fn install_with_fallback(
    ctx: &mut dyn ExecutionContext,
    platform: &PlatformInfo,
    name: &str,
    result: &mut ModuleResult,
) {
    let install_argv: Vec<String> = match platform.family {
        Family::Alpine => vec!["apk".into(), "add".into(), name.into()],
        _ => vec!["apt-get".into(), "install".into(), "-y".into(), name.into()],
    };
    let argv_refs: Vec<&str> = install_argv.iter().map(String::as_str).collect();

    match ctx.run_command(&CommandSpec::mutating(&argv_refs)) {
        Ok(out) if out.success() => {
            let action = Action::InstalledPackage {
                name: name.to_string(),
                method: InstallMethod::Package,
            };
            result.intended.push(action.clone());
            if !ctx.dry_run() {
                result.performed.push(action);
            }
        }
        Ok(_) | Err(HardnError::CommandFailed { .. }) => {
            // Repo has no package: fetch and unpack the upstream release.
            let fetch = CommandSpec::mutating(&[
                "curl", "-fsSL", TARBALL_URL, "-o", TARBALL_TMP,
            ])
            .with_timeout(Duration::from_secs(300));
            match ctx.run_command(&fetch) {
                Ok(out) if out.success() => {}
                Ok(out) => {
                    result.errors.push(HardnError::CommandFailed {
                        argv: fetch.argv.clone(),
                        exit: out.exit,
                        stderr: out.stderr,
                    });
                    return;
                }
                Err(e) => {
                    result.errors.push(e);
                    return;
                }
            }
            let unpack =
                CommandSpec::mutating(&["tar", "-xzf", TARBALL_TMP, "-C", "/usr/local"]);
            match ctx.run_command(&unpack) {
                Ok(out) if out.success() => {
                    let action = Action::InstalledPackage {
                        name: name.to_string(),
                        method: InstallMethod::Tarball,
                    };
                    result.intended.push(action.clone());
                    if !ctx.dry_run() {
                        result.performed.push(action);
                    }
                }
                Ok(out) => result.errors.push(HardnError::CommandFailed {
                    argv: unpack.argv.clone(),
                    exit: out.exit,
                    stderr: out.stderr,
                }),
                Err(e) => result.errors.push(e),
            }
        }
        Err(e) => result.errors.push(e),
    }
}
