use std::path::{Path, PathBuf};

use crate::core::error::HardnResult;
use crate::core::plan::HardeningPlan;
use crate::core::platform::PlatformInfo;
use crate::engine::framework::{
    Concern, ConcernModule, DnsState, ModuleState, ResolverFlavor, Step,
};
use crate::execution::context::{ExecutionContext, Owner};
use crate::execution::mutator::MODE_CONFIG;
use crate::execution::service::SVC_RESOLVED;

pub const RESOLV_CONF: &str = "/etc/resolv.conf";
pub const RESOLVED_DROPIN_DIR: &str = "/etc/systemd/resolved.conf.d";
pub const RESOLVED_DROPIN: &str = "/etc/systemd/resolved.conf.d/hardn.conf";
pub const RESOLVCONF_HEAD: &str = "/etc/resolvconf/resolv.conf.d/head";

/// Resolver configuration via whichever mechanism actually owns
/// /etc/resolv.conf on this host.
pub struct DnsModule;

impl DnsModule {
    /// Probe order: systemd-resolved active, then a resolvconf install,
    /// then direct file management as the fallback.
    pub fn detect_flavor(ctx: &mut dyn ExecutionContext) -> ResolverFlavor {
        if ctx.query_service(SVC_RESOLVED).active {
            return ResolverFlavor::SystemdResolved;
        }
        if ctx.stat(Path::new("/sbin/resolvconf")).is_some()
            || ctx.stat(Path::new("/usr/sbin/resolvconf")).is_some()
        {
            return ResolverFlavor::Resolvconf;
        }
        ResolverFlavor::Direct
    }

    fn current_nameservers(ctx: &mut dyn ExecutionContext) -> Vec<String> {
        let Some(content) = ctx.read_to_string(RESOLV_CONF.as_ref()) else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|line| {
                let mut tokens = line.split_whitespace();
                match tokens.next() {
                    Some("nameserver") => tokens.next().map(str::to_string),
                    _ => None,
                }
            })
            .collect()
    }
}

impl ConcernModule for DnsModule {
    fn concern(&self) -> Concern {
        Concern::Dns
    }

    fn audit(
        &self,
        ctx: &mut dyn ExecutionContext,
        _platform: &PlatformInfo,
    ) -> HardnResult<ModuleState> {
        let flavor = Self::detect_flavor(ctx);
        let nameservers = Self::current_nameservers(ctx);
        let resolv_conf_is_symlink = ctx
            .stat(RESOLV_CONF.as_ref())
            .is_some_and(|i| i.is_symlink);
        Ok(ModuleState::Dns(DnsState {
            flavor,
            nameservers,
            resolv_conf_is_symlink,
        }))
    }

    fn plan(
        &self,
        _ctx: &mut dyn ExecutionContext,
        _platform: &PlatformInfo,
        plan: &HardeningPlan,
        state: &ModuleState,
    ) -> HardnResult<Vec<Step>> {
        let Some(dns) = &plan.dns else {
            return Ok(Vec::new());
        };
        if dns.nameservers.is_empty() {
            return Ok(Vec::new());
        }
        let ModuleState::Dns(current) = state else {
            return Ok(Vec::new());
        };

        let mut steps = Vec::new();
        match current.flavor {
            ResolverFlavor::SystemdResolved => {
                let mut content = String::from("[Resolve]\n");
                content.push_str(&format!("DNS={}\n", dns.nameservers.join(" ")));
                if let Some(domain) = &dns.search_domain {
                    content.push_str(&format!("Domains={domain}\n"));
                }
                steps.push(Step::EnsureDir {
                    path: PathBuf::from(RESOLVED_DROPIN_DIR),
                    mode: 0o755,
                    owner: Owner::Root,
                });
                steps.push(Step::WriteManaged {
                    path: PathBuf::from(RESOLVED_DROPIN),
                    content,
                    mode: MODE_CONFIG,
                    owner: Owner::Root,
                    destructive_symlink: false,
                });
                steps.push(Step::RestartService {
                    logical: SVC_RESOLVED.to_string(),
                    only_if_changed: true,
                });
            }
            ResolverFlavor::Resolvconf => {
                let mut content = String::new();
                for ns in &dns.nameservers {
                    content.push_str(&format!("nameserver {ns}\n"));
                }
                if let Some(domain) = &dns.search_domain {
                    content.push_str(&format!("search {domain}\n"));
                }
                steps.push(Step::WriteManaged {
                    path: PathBuf::from(RESOLVCONF_HEAD),
                    content,
                    mode: MODE_CONFIG,
                    owner: Owner::Root,
                    destructive_symlink: false,
                });
                steps.push(Step::Command {
                    argv: vec!["resolvconf".into(), "-u".into()],
                    stdin: None,
                    timeout: None,
                    done: None,
                    fatal: false,
                    only_if_changed: true,
                });
            }
            ResolverFlavor::Direct => {
                let mut content = String::new();
                for ns in &dns.nameservers {
                    content.push_str(&format!("nameserver {ns}\n"));
                }
                if let Some(domain) = &dns.search_domain {
                    content.push_str(&format!("search {domain}\n"));
                }
                // A symlinked resolv.conf (stub managed elsewhere) gets
                // replaced by a regular file; the write is flagged as
                // destructive and the link target lands in the backup.
                steps.push(Step::WriteManaged {
                    path: PathBuf::from(RESOLV_CONF),
                    content,
                    mode: MODE_CONFIG,
                    owner: Owner::Root,
                    destructive_symlink: true,
                });
            }
        }

        Ok(steps)
    }
}
