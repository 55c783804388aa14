//! Shared state between the Supervisor and Housekeeper tasks (spec §5).
//!
//! The Supervisor is the sole writer; the Housekeeper only ever reads a
//! snapshot before deciding whether to act. A `std::sync::Mutex` would be
//! fine too since critical sections are short, but everything else in this
//! crate already holds its locks across `.await` points, so `tokio::sync::Mutex`
//! keeps the locking style uniform.

use crate::member::Member;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct Inner {
    pub child_pid: Option<u32>,
    pub run_old: bool,
    pub me: Option<Member>,
}

#[derive(Debug, Default)]
pub struct SharedState {
    inner: Mutex<Inner>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Inner {
        let guard = self.inner.lock().await;
        Inner { child_pid: guard.child_pid, run_old: guard.run_old, me: guard.me.clone() }
    }

    pub async fn set_child(&self, pid: Option<u32>, run_old: bool) {
        let mut guard = self.inner.lock().await;
        guard.child_pid = pid;
        guard.run_old = run_old;
    }

    pub async fn set_me(&self, me: Member) {
        let mut guard = self.inner.lock().await;
        guard.me = Some(me);
    }

    pub async fn child_pid(&self) -> Option<u32> {
        self.inner.lock().await.child_pid
    }
}
