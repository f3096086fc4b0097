//! Process-wide libssh2 startup tracking.

use std::sync::Mutex;

static USERS: Mutex<usize> = Mutex::new(0);

/// Keeps the SSH runtime initialised while alive.
///
/// Guards nest; only the outermost one performs initialisation on creation
/// and marks the runtime stopped on drop.
#[must_use = "the runtime stops when the guard is dropped"]
#[derive(Debug)]
pub struct Startup {
    _private: (),
}

/// Initialise the SSH runtime and return a guard holding it.
pub fn startup() -> Startup {
    let mut users = lock_users();
    if *users == 0 {
        ssh2::init();
        log::debug!("ssh runtime started");
    }
    *users += 1;

    Startup { _private: () }
}

/// Whether at least one [`Startup`] guard is alive.
pub fn is_ready() -> bool {
    *lock_users() > 0
}

impl Drop for Startup {
    fn drop(&mut self) {
        let mut users = lock_users();
        *users = users.saturating_sub(1);
        if *users == 0 {
            // libssh2 global state lives until process exit.
            log::debug!("ssh runtime stopped");
        }
    }
}

fn lock_users() -> std::sync::MutexGuard<'static, usize> {
    USERS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
