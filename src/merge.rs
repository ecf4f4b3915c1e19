use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use crate::{
    context::{AfterFunc, Context},
    error::Error,
};

/// A shared context that is cancelled once every member context is done.
///
/// The collector building the merge holds a stake of its own until [`seal`](Self::seal), so a
/// member that is already cancelled when it is added cannot cancel the shared context while more
/// members are still being gathered.
pub struct Merge {
    ctx: Context,
    live: Arc<AtomicUsize>,
    watchers: Vec<AfterFunc>,
}

impl Merge {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            live: Arc::new(AtomicUsize::new(1)),
            watchers: Vec::new(),
        }
    }

    /// Start over with a fresh shared context, stopping any watchers left from the last round but
    /// keeping the allocation.
    pub fn reset(&mut self, ctx: Context) {
        self.stop();
        self.ctx = ctx;
        self.live = Arc::new(AtomicUsize::new(1));
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn add(&mut self, member: &Context) {
        self.live.fetch_add(1, Ordering::AcqRel);
        let live = Arc::clone(&self.live);
        let ctx = self.ctx.clone();
        self.watchers.push(member.after_func(move || release(&live, &ctx)));
    }

    /// Drop the collector's own stake. Must be called exactly once per round.
    pub fn seal(&self) {
        release(&self.live, &self.ctx);
    }

    /// Unregister every member watcher.
    pub fn stop(&mut self) {
        for watcher in self.watchers.drain(..) {
            watcher.stop();
        }
    }
}

fn release(live: &AtomicUsize, ctx: &Context) {
    if live.fetch_sub(1, Ordering::AcqRel) == 1 {
        ctx.cancel(Error::Canceled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancels_after_last_member() {
        let members = [Context::new(), Context::new(), Context::new()];
        let mut merge = Merge::new(Context::new());
        for member in &members {
            merge.add(member);
        }
        merge.seal();

        members[0].cancel(Error::Canceled);
        members[2].cancel(Error::Canceled);
        assert!(!merge.context().is_done());
        members[1].cancel(Error::Canceled);
        assert!(merge.context().is_done());
    }

    #[test]
    fn done_member_does_not_cancel_before_seal() {
        let gone = Context::new();
        gone.cancel(Error::Canceled);
        let alive = Context::new();

        let mut merge = Merge::new(Context::new());
        merge.add(&gone);
        assert!(!merge.context().is_done());
        merge.add(&alive);
        merge.seal();
        assert!(!merge.context().is_done());

        alive.cancel(Error::Canceled);
        assert!(merge.context().is_done());
    }

    #[test]
    fn seal_with_every_member_gone_cancels() {
        let gone = Context::new();
        gone.cancel(Error::Canceled);
        let mut merge = Merge::new(Context::new());
        merge.add(&gone);
        merge.seal();
        assert!(merge.context().is_done());
    }

    #[test]
    fn stopped_watchers_never_fire() {
        let member = Context::new();
        let mut merge = Merge::new(Context::new());
        merge.add(&member);
        merge.seal();
        merge.stop();

        member.cancel(Error::Canceled);
        assert!(!merge.context().is_done());
    }

    #[test]
    fn reset_detaches_previous_round() {
        let first = Context::new();
        let old = Context::new();
        let mut merge = Merge::new(old.clone());
        merge.add(&first);
        merge.seal();

        let fresh = Context::new();
        merge.reset(fresh.clone());
        first.cancel(Error::Canceled);
        assert!(!old.is_done());
        assert!(!fresh.is_done());
    }

    #[test]
    fn concurrent_last_releases_cancel_once() {
        let members: Vec<_> = (0..64).map(|_| Context::new()).collect();
        let shared = Context::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let _watch = shared.after_func(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut merge = Merge::new(shared.clone());
        for member in &members {
            merge.add(member);
        }
        merge.seal();

        std::thread::scope(|s| {
            for member in &members {
                s.spawn(move || member.cancel(Error::Canceled));
            }
        });
        assert!(shared.is_done());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
