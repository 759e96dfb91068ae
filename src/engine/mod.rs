pub mod auditor;
pub mod executor;
pub mod framework;
pub mod risk;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::error::{HardnError, HardnResult};
use crate::core::plan::HardeningPlan;
use crate::core::platform::PlatformInfo;
use crate::core::status::SecurityStatus;
use crate::engine::framework::{ConcernModule, ModuleResult};
use crate::engine::risk::RiskAssessment;
use crate::execution::context::ExecutionContext;
use crate::modules::{
    ApparmorModule, DnsModule, FirewallModule, LynisModule, SourcesModule, SshModule,
    UpgradesModule, UserModule,
};
use crate::utils::Logger;

/// Outcome of a full engine run: per-module results plus the post-run
/// posture snapshot and its risk assessment.
#[derive(Debug)]
pub struct EngineReport {
    pub results: Vec<ModuleResult>,
    pub status: SecurityStatus,
    pub risk: RiskAssessment,
    pub backup_root: PathBuf,
    pub cancelled: bool,
}

impl EngineReport {
    /// Process exit code per the CLI contract: the most specific error
    /// present wins; Unsupported skips are not errors.
    pub fn exit_code(&self) -> i32 {
        let mut code = crate::core::config::EXIT_SUCCESS;
        for result in &self.results {
            for error in &result.errors {
                let candidate = error.exit_code();
                match error {
                    HardnError::LockoutRisk => return candidate,
                    _ if code == crate::core::config::EXIT_SUCCESS => code = candidate,
                    _ => {}
                }
            }
        }
        code
    }
}

/// Composes the concern modules in a fixed dependency order and drives
/// Audit -> Plan -> Apply for each, sequentially, on one thread.
pub struct HardeningEngine {
    platform: PlatformInfo,
    modules: Vec<Box<dyn ConcernModule>>,
}

impl HardeningEngine {
    /// Order matters: sources first so installs see fresh indexes, the user
    /// before SSH so the lockout guard has its candidate, the firewall
    /// after SSH so the injected rule matches the final port.
    pub fn new(platform: PlatformInfo) -> Self {
        let modules: Vec<Box<dyn ConcernModule>> = vec![
            Box::new(SourcesModule),
            Box::new(UserModule),
            Box::new(SshModule),
            Box::new(FirewallModule),
            Box::new(DnsModule),
            Box::new(ApparmorModule),
            Box::new(UpgradesModule),
            Box::new(LynisModule),
        ];
        Self { platform, modules }
    }

    pub fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    /// Read-only posture sample; used by the status display and by the
    /// post-run snapshot.
    pub fn audit(&self, ctx: &mut dyn ExecutionContext) -> SecurityStatus {
        auditor::collect(ctx, &self.platform)
    }

    pub fn run(
        &self,
        ctx: &mut dyn ExecutionContext,
        plan: &HardeningPlan,
        cancel: &AtomicBool,
        logger: &mut Logger,
    ) -> HardnResult<EngineReport> {
        plan.validate()?;
        ctx.lock_run(&plan.global.backup_root)?;

        let mut results = Vec::new();
        let mut cancelled = false;

        for module in &self.modules {
            if cancel.load(Ordering::Relaxed) {
                cancelled = true;
                logger.warning(None, "cancellation requested; stopping between modules");
                break;
            }

            let concern = module.concern();
            let state = match module.audit(ctx, &self.platform) {
                Ok(state) => state,
                Err(e) => {
                    logger.error(Some(concern.as_str()), &format!("audit failed: {e}"));
                    let mut result = ModuleResult::new(concern);
                    result.errors.push(e);
                    results.push(result);
                    continue;
                }
            };

            let steps = match module.plan(ctx, &self.platform, plan, &state) {
                Ok(steps) => steps,
                Err(HardnError::UnsupportedPlatform { family, concern }) => {
                    logger.warning(
                        Some(concern.as_str()),
                        &format!("{concern} has no mechanism on {family}; skipping"),
                    );
                    results.push(ModuleResult::unsupported(concern, family));
                    continue;
                }
                Err(e) => {
                    // LockoutRisk and validation failures are fatal for the
                    // module; the engine keeps going and reports prominently.
                    logger.error(Some(concern.as_str()), &format!("refused: {e}"));
                    let mut result = ModuleResult::new(concern);
                    result.errors.push(e);
                    results.push(result);
                    continue;
                }
            };

            if steps.is_empty() {
                results.push(ModuleResult::new(concern));
                continue;
            }

            let result = module.apply(ctx, &self.platform, steps);
            for error in &result.errors {
                logger.error(Some(concern.as_str()), &error.to_string());
            }
            for action in &result.performed {
                logger.pass(Some(concern.as_str()), &action.to_string());
            }
            if ctx.dry_run() {
                for action in &result.intended {
                    logger.info(Some(concern.as_str()), &format!("would: {action}"));
                }
            }
            results.push(result);
        }

        let status = self.audit(ctx);
        let risk = risk::score(&status, self.platform.family);
        logger.info(
            None,
            &format!("post-run risk: {} ({})", risk.level, risk.rationale),
        );

        Ok(EngineReport {
            results,
            status,
            risk,
            backup_root: plan.global.backup_root.clone(),
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::{SshPlan, UserPlan};
    use crate::core::platform::{Family, InitSystem};
    use crate::execution::memory::MemoryContext;

    fn debian() -> PlatformInfo {
        PlatformInfo {
            family: Family::Debian,
            version: "12".into(),
            codename: "bookworm".into(),
            kernel: "6.1.0-test".into(),
            init: InitSystem::Systemd,
        }
    }

    fn seeded_ctx() -> MemoryContext {
        let mut ctx = MemoryContext::new();
        ctx.seed_file("/etc/passwd", "root:x:0:0:root:/root:/bin/bash\n");
        ctx.seed_file("/etc/group", "sudo:x:27:\n");
        ctx.seed_file("/etc/ssh/sshd_config", "PermitRootLogin yes\n");
        ctx.seed_dir("/etc/ssh/sshd_config.d");
        ctx.seed_service("ssh", true, true, true);
        ctx
    }

    #[test]
    fn lock_contention_aborts_the_run() {
        let mut ctx = seeded_ctx();
        ctx.hold_lock_elsewhere();

        let engine = HardeningEngine::new(debian());
        let plan = HardeningPlan::default();
        let cancel = AtomicBool::new(false);
        let mut logger = Logger::new(None);

        match engine.run(&mut ctx, &plan, &cancel, &mut logger) {
            Err(HardnError::AlreadyRunning) => {}
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_returns_partial_results() {
        let mut ctx = seeded_ctx();
        let engine = HardeningEngine::new(debian());
        let plan = HardeningPlan::default();
        let cancel = AtomicBool::new(true);
        let mut logger = Logger::new(None);

        let report = engine.run(&mut ctx, &plan, &cancel, &mut logger).unwrap();
        assert!(report.cancelled);
        assert!(report.results.is_empty());
    }

    #[test]
    fn lockout_refusal_still_lets_other_modules_run() {
        let mut ctx = seeded_ctx();
        let engine = HardeningEngine::new(debian());
        // Disable root login with no candidate user anywhere: SSH must
        // refuse, everything else proceeds.
        let plan = HardeningPlan {
            ssh: Some(SshPlan {
                permit_root_login: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };
        let cancel = AtomicBool::new(false);
        let mut logger = Logger::new(None);

        let report = engine.run(&mut ctx, &plan, &cancel, &mut logger).unwrap();
        let ssh_result = report
            .results
            .iter()
            .find(|r| r.concern == framework::Concern::Ssh)
            .unwrap();
        assert!(matches!(ssh_result.errors[0], HardnError::LockoutRisk));
        // No SSH files were touched.
        assert!(ctx.file_string("/etc/ssh/sshd_config.d/hardn.conf").is_none());
        assert_eq!(report.exit_code(), crate::core::config::EXIT_LOCKOUT);
    }

    #[test]
    fn user_module_runs_before_ssh_for_the_guard() {
        let mut ctx = seeded_ctx();
        let engine = HardeningEngine::new(debian());
        let plan = HardeningPlan {
            user: Some(UserPlan {
                username: "ops".into(),
                create_if_missing: true,
                sudo_no_password: true,
                authorized_keys: vec!["ssh-ed25519 AAAA ops@laptop".into()],
                replace_keys: false,
            }),
            ssh: Some(SshPlan {
                permit_root_login: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };
        let cancel = AtomicBool::new(false);
        let mut logger = Logger::new(None);

        let report = engine.run(&mut ctx, &plan, &cancel, &mut logger).unwrap();
        assert_eq!(report.exit_code(), 0, "results: {:?}", report.results);
        assert!(ctx
            .file_string("/etc/ssh/sshd_config.d/hardn.conf")
            .unwrap()
            .contains("PermitRootLogin no"));
    }
}
