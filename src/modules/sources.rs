use std::path::PathBuf;

use crate::core::error::HardnResult;
use crate::core::plan::{HardeningPlan, SourcesPlan};
use crate::core::platform::{Family, PlatformInfo};
use crate::engine::framework::{
    Concern, ConcernModule, ModuleState, SourcesState, Step,
};
use crate::execution::context::{ExecutionContext, Owner};
use crate::execution::mutator::MODE_CONFIG;

pub const APT_SOURCES: &str = "/etc/apt/sources.list";
pub const CEPH_LIST: &str = "/etc/apt/sources.list.d/ceph.list";
pub const PVE_ENTERPRISE_LIST: &str = "/etc/apt/sources.list.d/pve-enterprise.list";
pub const APK_REPOSITORIES: &str = "/etc/apk/repositories";
pub const ALPINE_TESTING_REPO: &str = "http://dl-cdn.alpinelinux.org/alpine/edge/testing";

/// The literal placeholder operators write in repo lines.
const CODENAME_TOKEN: &str = "CODENAME";

/// Package source curation: apt lists on Debian-family (plus the Proxmox
/// ceph/enterprise lists), apk repositories on Alpine.
pub struct SourcesModule;

impl SourcesModule {
    fn substitute(lines: &[String], codename: &str) -> String {
        let mut out = String::new();
        for line in lines {
            out.push_str(&line.replace(CODENAME_TOKEN, codename));
            out.push('\n');
        }
        out
    }

    fn apt_sources_content(sources: &SourcesPlan, platform: &PlatformInfo) -> String {
        let mut content = Self::substitute(&sources.distro_repos, &platform.codename);
        if platform.family == Family::Proxmox && !sources.proxmox_main.is_empty() {
            content.push_str(&Self::substitute(&sources.proxmox_main, &platform.codename));
        }
        content
    }

    fn apk_content(sources: &SourcesPlan) -> String {
        let mut lines = sources.distro_repos.clone();
        if sources.alpine_testing {
            lines.push(ALPINE_TESTING_REPO.to_string());
        }
        let mut out = String::new();
        for line in lines {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

impl ConcernModule for SourcesModule {
    fn concern(&self) -> Concern {
        Concern::Sources
    }

    fn audit(
        &self,
        ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
    ) -> HardnResult<ModuleState> {
        let mut state = SourcesState::default();
        match platform.family {
            Family::Alpine => {
                state.apk_repositories = ctx.read_to_string(APK_REPOSITORIES.as_ref());
            }
            _ => {
                state.distro = ctx.read_to_string(APT_SOURCES.as_ref());
                state.proxmox_ceph = ctx.read_to_string(CEPH_LIST.as_ref());
                state.proxmox_enterprise = ctx.read_to_string(PVE_ENTERPRISE_LIST.as_ref());
            }
        }
        Ok(ModuleState::Sources(state))
    }

    fn plan(
        &self,
        _ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
        plan: &HardeningPlan,
        _state: &ModuleState,
    ) -> HardnResult<Vec<Step>> {
        let Some(sources) = &plan.sources else {
            return Ok(Vec::new());
        };

        let mut steps = Vec::new();

        match platform.family {
            Family::Alpine => {
                if sources.distro_repos.is_empty() && !sources.alpine_testing {
                    return Ok(Vec::new());
                }
                steps.push(Step::WriteManaged {
                    path: PathBuf::from(APK_REPOSITORIES),
                    content: Self::apk_content(sources),
                    mode: MODE_CONFIG,
                    owner: Owner::Root,
                    destructive_symlink: false,
                });
            }
            family => {
                if !sources.distro_repos.is_empty() {
                    steps.push(Step::WriteManaged {
                        path: PathBuf::from(APT_SOURCES),
                        content: Self::apt_sources_content(sources, platform),
                        mode: MODE_CONFIG,
                        owner: Owner::Root,
                        destructive_symlink: false,
                    });
                }
                if family == Family::Proxmox {
                    if !sources.proxmox_ceph.is_empty() {
                        steps.push(Step::WriteManaged {
                            path: PathBuf::from(CEPH_LIST),
                            content: Self::substitute(&sources.proxmox_ceph, &platform.codename),
                            mode: MODE_CONFIG,
                            owner: Owner::Root,
                            destructive_symlink: false,
                        });
                    }
                    if !sources.proxmox_enterprise.is_empty() {
                        steps.push(Step::WriteManaged {
                            path: PathBuf::from(PVE_ENTERPRISE_LIST),
                            content: Self::substitute(
                                &sources.proxmox_enterprise,
                                &platform.codename,
                            ),
                            mode: MODE_CONFIG,
                            owner: Owner::Root,
                            destructive_symlink: false,
                        });
                    }
                }
            }
        }

        if steps.is_empty() {
            return Ok(Vec::new());
        }

        // Index refresh happens once, only when some list actually changed.
        steps.push(Step::RefreshPackageIndex {
            only_if_changed: true,
        });
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::platform::InitSystem;
    use crate::execution::memory::MemoryContext;

    fn proxmox() -> PlatformInfo {
        PlatformInfo {
            family: Family::Proxmox,
            version: "8".into(),
            codename: "bookworm".into(),
            kernel: "6.8.0-pve".into(),
            init: InitSystem::Systemd,
        }
    }

    fn alpine() -> PlatformInfo {
        PlatformInfo {
            family: Family::Alpine,
            version: "3.19".into(),
            codename: String::new(),
            kernel: "6.6.0-test".into(),
            init: InitSystem::OpenRc,
        }
    }

    fn proxmox_plan() -> HardeningPlan {
        HardeningPlan {
            sources: Some(SourcesPlan {
                distro_repos: vec![
                    "deb http://deb.debian.org/debian CODENAME main contrib".into(),
                    "deb http://security.debian.org/debian-security CODENAME-security main".into(),
                ],
                proxmox_main: vec![
                    "deb http://download.proxmox.com/debian/pve CODENAME pve-no-subscription".into(),
                ],
                proxmox_ceph: vec![
                    "deb http://download.proxmox.com/debian/ceph-quincy CODENAME no-subscription".into(),
                ],
                proxmox_enterprise: vec![
                    "# deb https://enterprise.proxmox.com/debian/pve CODENAME pve-enterprise".into(),
                ],
                alpine_testing: false,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn proxmox_writes_all_three_lists_then_updates_once() {
        let mut ctx = MemoryContext::new();
        let module = SourcesModule;
        let platform = proxmox();
        let plan = proxmox_plan();

        let state = module.audit(&mut ctx, &platform).unwrap();
        let steps = module.plan(&mut ctx, &platform, &plan, &state).unwrap();
        let result = module.apply(&mut ctx, &platform, steps);

        assert!(result.ok(), "errors: {:?}", result.errors);
        let sources = ctx.file_string(APT_SOURCES).unwrap();
        assert!(sources.contains("deb http://deb.debian.org/debian bookworm main contrib"));
        assert!(sources.contains("bookworm pve-no-subscription"));
        assert!(!sources.contains("CODENAME"));

        let ceph = ctx.file_string(CEPH_LIST).unwrap();
        assert!(ceph.contains("ceph-quincy bookworm no-subscription"));
        let enterprise = ctx.file_string(PVE_ENTERPRISE_LIST).unwrap();
        assert!(enterprise.contains("bookworm pve-enterprise"));

        let updates: Vec<_> = ctx
            .commands_run
            .iter()
            .filter(|c| c.argv == vec!["apt-get", "update"])
            .collect();
        assert_eq!(updates.len(), 1, "apt-get update must run exactly once");
    }

    #[test]
    fn identical_desired_content_skips_the_update() {
        let mut ctx = MemoryContext::new();
        let module = SourcesModule;
        let platform = proxmox();
        let plan = proxmox_plan();

        let state = module.audit(&mut ctx, &platform).unwrap();
        let steps = module.plan(&mut ctx, &platform, &plan, &state).unwrap();
        module.apply(&mut ctx, &platform, steps);
        let update_count_before = ctx
            .commands_run
            .iter()
            .filter(|c| c.argv == vec!["apt-get", "update"])
            .count();

        let state = module.audit(&mut ctx, &platform).unwrap();
        let steps = module.plan(&mut ctx, &platform, &plan, &state).unwrap();
        let result = module.apply(&mut ctx, &platform, steps);

        assert!(result.performed.is_empty());
        let update_count_after = ctx
            .commands_run
            .iter()
            .filter(|c| c.argv == vec!["apt-get", "update"])
            .count();
        assert_eq!(update_count_before, update_count_after);
    }

    #[test]
    fn alpine_writes_repositories_with_testing_line() {
        let mut ctx = MemoryContext::new();
        let module = SourcesModule;
        let platform = alpine();
        let plan = HardeningPlan {
            sources: Some(SourcesPlan {
                distro_repos: vec![
                    "http://dl-cdn.alpinelinux.org/alpine/v3.19/main".into(),
                    "http://dl-cdn.alpinelinux.org/alpine/v3.19/community".into(),
                ],
                alpine_testing: true,
                ..Default::default()
            }),
            ..Default::default()
        };

        let state = module.audit(&mut ctx, &platform).unwrap();
        let steps = module.plan(&mut ctx, &platform, &plan, &state).unwrap();
        let result = module.apply(&mut ctx, &platform, steps);

        assert!(result.ok(), "errors: {:?}", result.errors);
        let repos = ctx.file_string(APK_REPOSITORIES).unwrap();
        assert!(repos.contains("v3.19/main"));
        assert!(repos.contains(ALPINE_TESTING_REPO));
        assert!(ctx
            .commands_run
            .iter()
            .any(|c| c.argv == vec!["apk", "update"]));
    }

    #[test]
    fn testing_line_is_omitted_by_default() {
        let mut ctx = MemoryContext::new();
        let module = SourcesModule;
        let platform = alpine();
        let plan = HardeningPlan {
            sources: Some(SourcesPlan {
                distro_repos: vec!["http://dl-cdn.alpinelinux.org/alpine/v3.19/main".into()],
                ..Default::default()
            }),
            ..Default::default()
        };

        let state = module.audit(&mut ctx, &platform).unwrap();
        let steps = module.plan(&mut ctx, &platform, &plan, &state).unwrap();
        module.apply(&mut ctx, &platform, steps);

        let repos = ctx.file_string(APK_REPOSITORIES).unwrap();
        assert!(!repos.contains("edge/testing"));
    }

    #[test]
    fn empty_sources_section_plans_nothing() {
        let mut ctx = MemoryContext::new();
        let module = SourcesModule;
        let platform = proxmox();
        let plan = HardeningPlan {
            sources: Some(SourcesPlan::default()),
            ..Default::default()
        };

        let state = module.audit(&mut ctx, &platform).unwrap();
        let steps = module.plan(&mut ctx, &platform, &plan, &state).unwrap();
        assert!(steps.is_empty());
    }
}
