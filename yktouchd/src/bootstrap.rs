/// Process hardening applied at daemon startup, before any socket is
/// proxied.
///
/// The relay buffers carry live SSH-agent protocol traffic, which must
/// not end up in a core dump or be readable through `/proc/<pid>/mem` by
/// other processes.  Best-effort and non-fatal: a warning is logged if
/// the call fails and the daemon continues.
#[cfg(unix)]
pub fn secure_bootstrap() {
    // SAFETY: prctl is safe to call with PR_SET_DUMPABLE and plain integer args.
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0i64, 0i64, 0i64, 0i64) };
    if ret == 0 {
        tracing::debug!("PR_SET_DUMPABLE=0: core dumps and /proc/pid/mem access disabled");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("PR_SET_DUMPABLE=0 failed (non-fatal): {err}");
    }
}

/// No-op on non-unix platforms.
#[cfg(not(unix))]
pub fn secure_bootstrap() {}
