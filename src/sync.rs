//! Process-shared mutex and condition variable
//!
//! Thin wrappers over `pthread_mutex_t` / `pthread_cond_t` meant to live
//! inside a shared mapping. Both are always initialized with
//! `PTHREAD_PROCESS_SHARED`; there is no process-private variant. On Linux the
//! mutex is also robust, so a peer dying while it holds the lock surfaces as
//! [`ChannelError::PeerDied`] rather than a permanent hang.
//!
//! Neither type is constructed by value. Both are initialized in place through
//! a raw pointer into memory that never moves afterwards.

use crate::error::{ChannelError, Result};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ops::{Deref, DerefMut};

fn check(op: &'static str, rc: libc::c_int) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(ChannelError::sync(op, rc))
    }
}

/// Mutex guarding a value of type `T`, both stored in shared memory
#[repr(C)]
pub struct SharedMutex<T> {
    raw: UnsafeCell<libc::pthread_mutex_t>,
    data: UnsafeCell<T>,
}

// SAFETY: all access to `data` goes through the pthread lock.
unsafe impl<T: Send> Send for SharedMutex<T> {}
unsafe impl<T: Send> Sync for SharedMutex<T> {}

impl<T> SharedMutex<T> {
    /// Initialize a mutex and its protected value in place
    ///
    /// # Safety
    /// - `this` must point to writable, properly aligned memory for `Self`
    /// - no other thread or process may use the mutex until this returns
    /// - the mutex must not already be initialized
    pub unsafe fn init(this: *mut Self, value: T) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check("pthread_mutexattr_init", libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;

        let raw = UnsafeCell::raw_get(std::ptr::addr_of!((*this).raw));
        let configured = check(
            "pthread_mutexattr_setpshared",
            libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
        )
        .and_then(|()| set_robust(attr.as_mut_ptr()))
        .and_then(|()| check("pthread_mutex_init", libc::pthread_mutex_init(raw, attr.as_ptr())));

        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        configured?;

        std::ptr::write(UnsafeCell::raw_get(std::ptr::addr_of!((*this).data)), value);
        Ok(())
    }

    /// Acquire the lock, blocking until it is available
    pub fn lock(&self) -> Result<SharedMutexGuard<'_, T>> {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        self.locked("pthread_mutex_lock", rc)?;
        Ok(SharedMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }

    /// Turn the return code of a lock or wait into a held lock or an error.
    ///
    /// `EOWNERDEAD` means we now hold a lock whose previous owner died. The
    /// lock is marked consistent so the peer can keep using it, then released.
    fn locked(&self, op: &'static str, rc: libc::c_int) -> Result<()> {
        match rc {
            0 => Ok(()),
            #[cfg(target_os = "linux")]
            libc::EOWNERDEAD => {
                unsafe {
                    libc::pthread_mutex_consistent(self.raw.get());
                    libc::pthread_mutex_unlock(self.raw.get());
                }
                Err(ChannelError::PeerDied)
            }
            rc => Err(ChannelError::sync(op, rc)),
        }
    }

    /// Destroy the mutex
    ///
    /// # Safety
    /// The mutex must be unlocked and no other thread or process may use it
    /// afterwards.
    pub unsafe fn destroy(&self) -> Result<()> {
        check("pthread_mutex_destroy", libc::pthread_mutex_destroy(self.raw.get()))
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_robust(attr: *mut libc::pthread_mutexattr_t) -> Result<()> {
    check(
        "pthread_mutexattr_setrobust",
        libc::pthread_mutexattr_setrobust(attr, libc::PTHREAD_MUTEX_ROBUST),
    )
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_robust(_attr: *mut libc::pthread_mutexattr_t) -> Result<()> {
    Ok(())
}

/// RAII guard for [`SharedMutex`]; unlocks on drop
pub struct SharedMutexGuard<'a, T> {
    mutex: &'a SharedMutex<T>,
    // pthread mutexes must be unlocked by the locking thread
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for SharedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SharedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SharedMutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.raw.get());
        }
    }
}

/// Condition variable stored in shared memory
#[repr(C)]
pub struct SharedCondvar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for SharedCondvar {}
unsafe impl Sync for SharedCondvar {}

impl SharedCondvar {
    /// Initialize a condition variable in place
    ///
    /// # Safety
    /// Same contract as [`SharedMutex::init`].
    pub unsafe fn init(this: *mut Self) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        check("pthread_condattr_init", libc::pthread_condattr_init(attr.as_mut_ptr()))?;

        let raw = UnsafeCell::raw_get(std::ptr::addr_of!((*this).raw));
        let configured = check(
            "pthread_condattr_setpshared",
            libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
        )
        .and_then(|()| check("pthread_cond_init", libc::pthread_cond_init(raw, attr.as_ptr())));

        libc::pthread_condattr_destroy(attr.as_mut_ptr());
        configured
    }

    /// Block until notified, releasing the lock while waiting
    ///
    /// Wakeups may be spurious; callers re-check their predicate.
    pub fn wait<'a, T>(&self, guard: SharedMutexGuard<'a, T>) -> Result<SharedMutexGuard<'a, T>> {
        let mutex = guard.mutex;
        let rc = unsafe { libc::pthread_cond_wait(self.raw.get(), mutex.raw.get()) };
        // The lock is held again whatever the outcome; let `locked` decide
        // whether we keep it.
        std::mem::forget(guard);
        mutex.locked("pthread_cond_wait", rc)?;
        Ok(SharedMutexGuard {
            mutex,
            _not_send: PhantomData,
        })
    }

    /// Block while `condition` holds
    pub fn wait_while<'a, T, F>(
        &self,
        mut guard: SharedMutexGuard<'a, T>,
        mut condition: F,
    ) -> Result<SharedMutexGuard<'a, T>>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard)?;
        }
        Ok(guard)
    }

    /// Wake one waiter
    pub fn notify_one(&self) -> Result<()> {
        check("pthread_cond_signal", unsafe { libc::pthread_cond_signal(self.raw.get()) })
    }

    /// Wake every waiter
    pub fn notify_all(&self) -> Result<()> {
        check("pthread_cond_broadcast", unsafe {
            libc::pthread_cond_broadcast(self.raw.get())
        })
    }

    /// Destroy the condition variable
    ///
    /// # Safety
    /// No thread or process may be waiting on it or use it afterwards.
    pub unsafe fn destroy(&self) -> Result<()> {
        check("pthread_cond_destroy", libc::pthread_cond_destroy(self.raw.get()))
    }
}
