//! SIGSEGV registration.
//!
//! The handler needs to reach the live resolver, and signal handlers take
//! no user argument, so the resolver is published through one process-wide
//! slot. [`FaultHandlerGuard`] owns that slot for as long as it lives:
//! installing fills it and saves the previous disposition; dropping
//! restores both.

use std::fmt;
use std::fs::File;
use std::io;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::LoaderError;
use crate::fault::FaultResolver;
use crate::page::MmapMapper;

/// The resolver the signal handler drives: the image on disk and real
/// `mmap`.
pub type ProcessResolver = FaultResolver<File, MmapMapper>;

type SigInfoHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Resolver the handler dispatches to. Null when no guard is alive.
static ACTIVE: AtomicPtr<ProcessResolver> = AtomicPtr::new(ptr::null_mut());

/// Whether a [`FaultHandlerGuard`] is currently installed.
pub fn is_active() -> bool {
    !ACTIVE.load(Ordering::Acquire).is_null()
}

/// Scoped SIGSEGV handler routing faults to one resolver.
///
/// The guard mutably borrows the resolver, so nothing else can touch it
/// while faults may be resolved behind the program's back.
pub struct FaultHandlerGuard<'a> {
    previous: libc::sigaction,
    _resolver: PhantomData<&'a mut ProcessResolver>,
}

impl<'a> FaultHandlerGuard<'a> {
    /// Publish `resolver` and install the handler.
    ///
    /// Fails with [`LoaderError::HandlerBusy`] if another guard is alive.
    pub fn install(resolver: &'a mut ProcessResolver) -> Result<Self, LoaderError> {
        let resolver: *mut ProcessResolver = resolver;
        ACTIVE
            .compare_exchange(ptr::null_mut(), resolver, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| LoaderError::HandlerBusy)?;

        match install_handler() {
            Ok(previous) => {
                log::debug!("SIGSEGV handler installed");
                Ok(Self {
                    previous,
                    _resolver: PhantomData,
                })
            }
            Err(err) => {
                ACTIVE.store(ptr::null_mut(), Ordering::Release);
                Err(LoaderError::HandlerInstall(err))
            }
        }
    }
}

impl Drop for FaultHandlerGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: `previous` was filled in by a successful sigaction call.
        let rc = unsafe { libc::sigaction(libc::SIGSEGV, &self.previous, ptr::null_mut()) };
        if rc != 0 {
            log::warn!(
                "cannot restore the previous SIGSEGV handler: {}",
                io::Error::last_os_error()
            );
        }
        ACTIVE.store(ptr::null_mut(), Ordering::Release);
        log::debug!("SIGSEGV handler removed");
    }
}

impl fmt::Debug for FaultHandlerGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultHandlerGuard")
            .field("active", &is_active())
            .finish_non_exhaustive()
    }
}

fn install_handler() -> io::Result<libc::sigaction> {
    // SAFETY: all-zero is a valid sigaction (SIG_DFL, empty mask, no flags).
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = on_fault as SigInfoHandler as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO;

    // SAFETY: both pointers reference live, writable sigaction values.
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        let mut previous: libc::sigaction = mem::zeroed();
        if libc::sigaction(libc::SIGSEGV, &action, &mut previous) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(previous)
    }
}

extern "C" fn on_fault(_signum: libc::c_int, info: *mut libc::siginfo_t, _uctx: *mut libc::c_void) {
    let resolver = ACTIVE.load(Ordering::Acquire);
    if resolver.is_null() {
        // Nobody to resolve for: fall back to the default action, which the
        // retried access then triggers.
        // SAFETY: signal() is async-signal-safe.
        unsafe { libc::signal(libc::SIGSEGV, libc::SIG_DFL) };
        return;
    }

    // SAFETY: the kernel hands SA_SIGINFO handlers a valid siginfo_t.
    let addr = unsafe { (*info).si_addr() } as u64;

    // SAFETY: the slot is non-null only while a guard holds the exclusive
    // borrow of the resolver, and faults are delivered one at a time on
    // the faulting thread.
    let resolver = unsafe { &mut *resolver };

    if let Err(err) = resolver.resolve(addr) {
        log::error!("{err}");
        log::logger().flush();
        // SAFETY: _exit is async-signal-safe and never returns.
        unsafe { libc::_exit(1) };
    }
}
