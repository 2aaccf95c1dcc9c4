//! Syscall filter assembly
//!
//! Default action: allow.  On top of that, a fixed list of system
//! calls that enable container escape, privilege escalation or
//! time/system tampering is denied unconditionally, and `socket()` is
//! restricted to a small set of address families.  Requests may
//! compose further layers (deny user-namespace creation, multicast
//! setup, bind/listen).
//!
//! Each action gets its own BPF program; the programs are installed
//! back to back and the kernel runs all of them, so the most
//! restrictive verdict wins.

use std::collections::BTreeMap;

use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};

use crate::error::SpawnError;
use crate::Result;

/// The optional filter layers of one spawn request.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterOptions {
    /// `unshare`/`clone` with `CLONE_NEWUSER` fail with `EPERM`.
    pub forbid_user_ns: bool,
    /// Multicast `setsockopt` options fail with `EPERM`.
    pub forbid_multicast: bool,
    /// `bind`/`listen` fail with `EACCES`.
    pub forbid_bind: bool,
}

/// System calls denied for every child, regardless of request flags.
/// Calls that do not exist on the target architecture have no number
/// to deny and are simply absent (`stime`, `vm86`, `vm86old` and the
/// pre-64-bit module calls fall out this way).
const FORBIDDEN_SYSCALLS: &[libc::c_long] = &[
    libc::SYS_acct,
    libc::SYS_add_key,
    libc::SYS_adjtimex,
    libc::SYS_bpf,
    libc::SYS_clock_adjtime,
    libc::SYS_clock_settime,
    libc::SYS_delete_module,
    libc::SYS_fanotify_init,
    libc::SYS_fanotify_mark,
    libc::SYS_finit_module,
    libc::SYS_get_mempolicy,
    libc::SYS_init_module,
    libc::SYS_kcmp,
    libc::SYS_kexec_file_load,
    libc::SYS_kexec_load,
    libc::SYS_keyctl,
    libc::SYS_lookup_dcookie,
    libc::SYS_mbind,
    libc::SYS_move_pages,
    libc::SYS_name_to_handle_at,
    libc::SYS_nfsservctl,
    libc::SYS_perf_event_open,
    libc::SYS_personality,
    libc::SYS_process_vm_readv,
    libc::SYS_process_vm_writev,
    // ptrace allows breaking out of namespaces
    libc::SYS_ptrace,
    libc::SYS_quotactl,
    libc::SYS_reboot,
    libc::SYS_request_key,
    libc::SYS_set_mempolicy,
    libc::SYS_setns,
    libc::SYS_settimeofday,
    libc::SYS_swapoff,
    libc::SYS_swapon,
    libc::SYS_syslog,
    libc::SYS_userfaultfd,
];

#[cfg(target_arch = "x86_64")]
const FORBIDDEN_SYSCALLS_ARCH: &[libc::c_long] = &[
    libc::SYS_create_module,
    libc::SYS_get_kernel_syms,
    libc::SYS_ioperm,
    libc::SYS_iopl,
    libc::SYS_query_module,
    libc::SYS__sysctl,
    libc::SYS_sysfs,
    libc::SYS_uselib,
    libc::SYS_ustat,
];

#[cfg(not(target_arch = "x86_64"))]
const FORBIDDEN_SYSCALLS_ARCH: &[libc::c_long] = &[];

/// `socket()` address families children may use; must stay sorted.
const ALLOWED_SOCKET_DOMAINS: &[u64] = &[
    libc::AF_UNIX as u64, // AF_LOCAL
    libc::AF_INET as u64,
    libc::AF_INET6 as u64,
];

const FORBIDDEN_IP_OPTIONS: &[libc::c_int] = &[
    libc::IP_ADD_MEMBERSHIP,
    libc::IP_ADD_SOURCE_MEMBERSHIP,
    libc::IP_BLOCK_SOURCE,
    libc::IP_DROP_MEMBERSHIP,
    libc::IP_DROP_SOURCE_MEMBERSHIP,
    libc::IP_MULTICAST_ALL,
    libc::IP_MULTICAST_IF,
    libc::IP_MULTICAST_LOOP,
    libc::IP_MULTICAST_TTL,
    libc::IP_UNBLOCK_SOURCE,
];

const FORBIDDEN_IPV6_OPTIONS: &[libc::c_int] = &[
    libc::IPV6_ADD_MEMBERSHIP,
    libc::IPV6_DROP_MEMBERSHIP,
    libc::IPV6_MULTICAST_HOPS,
    libc::IPV6_MULTICAST_IF,
    libc::IPV6_MULTICAST_LOOP,
];

/// Build and install every filter layer.  Must be the last step
/// before `execve`.
pub fn install(options: &FilterOptions) -> Result<()> {
    for program in build(options)? {
        seccompiler::apply_filter(&program)
            .map_err(|err| SpawnError::Seccomp(format!("install filter: {err}")))?;
    }
    Ok(())
}

/// Compile the filter layers without installing them.
pub fn build(options: &FilterOptions) -> Result<Vec<BpfProgram>> {
    let mut programs = vec![compile(kill_filter()?)?, compile(socket_domain_filter()?)?];

    if options.forbid_user_ns || options.forbid_multicast {
        programs.push(compile(eperm_filter(options)?)?);
    }
    if options.forbid_bind {
        programs.push(compile(bind_filter()?)?);
    }

    Ok(programs)
}

fn compile(filter: SeccompFilter) -> Result<BpfProgram> {
    filter
        .try_into()
        .map_err(|err| SpawnError::Seccomp(format!("compile filter: {err}")))
}

fn new_filter(
    rules: BTreeMap<i64, Vec<SeccompRule>>,
    match_action: SeccompAction,
) -> Result<SeccompFilter> {
    SeccompFilter::new(rules, SeccompAction::Allow, match_action, target_arch())
        .map_err(|err| SpawnError::Seccomp(format!("assemble filter: {err}")))
}

fn condition(arg: u8, op: SeccompCmpOp, value: u64) -> Result<SeccompCondition> {
    SeccompCondition::new(arg, SeccompCmpArgLen::Qword, op, value)
        .map_err(|err| SpawnError::Seccomp(format!("argument condition: {err}")))
}

fn rule(conditions: Vec<SeccompCondition>) -> Result<SeccompRule> {
    SeccompRule::new(conditions)
        .map_err(|err| SpawnError::Seccomp(format!("filter rule: {err}")))
}

/// The unconditional denial list.  The rule map is keyed by syscall
/// number, so duplicate entries collapse to one.
fn kill_filter() -> Result<SeccompFilter> {
    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    for &nr in FORBIDDEN_SYSCALLS.iter().chain(FORBIDDEN_SYSCALLS_ARCH) {
        // an empty rule list matches the call unconditionally
        rules.insert(nr, Vec::new());
    }
    new_filter(rules, SeccompAction::KillThread)
}

/// `socket()` returns `EAFNOSUPPORT` outside the allowed domains.
/// "In the set" is encoded inverted: below the minimum, one rule per
/// value in each gap, above the maximum.
fn socket_domain_filter() -> Result<SeccompFilter> {
    let mut socket_rules = Vec::new();

    let first = ALLOWED_SOCKET_DOMAINS[0];
    let last = ALLOWED_SOCKET_DOMAINS[ALLOWED_SOCKET_DOMAINS.len() - 1];

    socket_rules.push(rule(vec![condition(0, SeccompCmpOp::Lt, first)?])?);

    for pair in ALLOWED_SOCKET_DOMAINS.windows(2) {
        for value in pair[0] + 1..pair[1] {
            socket_rules.push(rule(vec![condition(0, SeccompCmpOp::Eq, value)?])?);
        }
    }

    socket_rules.push(rule(vec![condition(0, SeccompCmpOp::Gt, last)?])?);

    let mut rules = BTreeMap::new();
    rules.insert(libc::SYS_socket, socket_rules);

    new_filter(
        rules,
        SeccompAction::Errno(libc::EAFNOSUPPORT as u32),
    )
}

/// The `EPERM` layer: user-namespace creation and/or multicast
/// socket options, as requested.
fn eperm_filter(options: &FilterOptions) -> Result<SeccompFilter> {
    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();

    if options.forbid_user_ns {
        let newuser = libc::CLONE_NEWUSER as u64;
        for nr in [libc::SYS_unshare, libc::SYS_clone] {
            rules.insert(
                nr,
                vec![rule(vec![condition(
                    0,
                    SeccompCmpOp::MaskedEq(newuser),
                    newuser,
                )?])?],
            );
        }
    }

    if options.forbid_multicast {
        let mut setsockopt_rules = Vec::new();
        for (level, optnames) in [
            (libc::IPPROTO_IP, FORBIDDEN_IP_OPTIONS),
            (libc::IPPROTO_IPV6, FORBIDDEN_IPV6_OPTIONS),
        ] {
            for &optname in optnames {
                setsockopt_rules.push(rule(vec![
                    condition(1, SeccompCmpOp::Eq, level as u64)?,
                    condition(2, SeccompCmpOp::Eq, optname as u64)?,
                ])?);
            }
        }
        rules.insert(libc::SYS_setsockopt, setsockopt_rules);
    }

    new_filter(rules, SeccompAction::Errno(libc::EPERM as u32))
}

/// `bind()` and `listen()` return `EACCES`.
fn bind_filter() -> Result<SeccompFilter> {
    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    rules.insert(libc::SYS_bind, Vec::new());
    rules.insert(libc::SYS_listen, Vec::new());
    new_filter(rules, SeccompAction::Errno(libc::EACCES as u32))
}

fn target_arch() -> TargetArch {
    #[cfg(target_arch = "x86_64")]
    return TargetArch::x86_64;

    #[cfg(target_arch = "aarch64")]
    return TargetArch::aarch64;

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    compile_error!("unsupported architecture for the syscall filter");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_layers_compile() {
        let programs = build(&FilterOptions::default()).unwrap();
        assert_eq!(programs.len(), 2);
        assert!(programs.iter().all(|p| !p.is_empty()));
    }

    #[test]
    fn optional_layers_add_programs() {
        let programs = build(&FilterOptions {
            forbid_user_ns: true,
            forbid_multicast: false,
            forbid_bind: false,
        })
        .unwrap();
        assert_eq!(programs.len(), 3);

        let programs = build(&FilterOptions {
            forbid_user_ns: true,
            forbid_multicast: true,
            forbid_bind: true,
        })
        .unwrap();
        assert_eq!(programs.len(), 4);
    }

    #[test]
    fn socket_domain_allow_list_is_sorted() {
        let mut sorted = ALLOWED_SOCKET_DOMAINS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted.as_slice(), ALLOWED_SOCKET_DOMAINS);
    }

    #[test]
    fn denial_list_has_no_effective_duplicates() {
        let mut seen = std::collections::BTreeSet::new();
        for &nr in FORBIDDEN_SYSCALLS.iter().chain(FORBIDDEN_SYSCALLS_ARCH) {
            // duplicates are tolerated by the builder; the set just
            // documents that the table is already clean
            seen.insert(nr);
        }
        assert_eq!(
            seen.len(),
            FORBIDDEN_SYSCALLS.len() + FORBIDDEN_SYSCALLS_ARCH.len()
        );
    }
}
