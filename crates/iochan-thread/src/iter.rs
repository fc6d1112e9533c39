//! Serialized cross-thread walks
//!
//! [`for_each_channel`] visits every thread holding a channel to a device,
//! one thread at a time, by passing the walk itself along as a message:
//!
//! ```text
//!   START ──► PER_CHANNEL(t1) ──continue──► PER_CHANNEL(t2) ── … ──► COMPLETE
//!     │        (on t1)                        (on t2)                (on origin)
//!     └── no holders ────────────────────────────────────────────────────┘
//! ```
//!
//! The walk state is owned by whichever step is running, so at most one
//! per-channel call is ever outstanding.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, trace};

use iochan_core::{DeviceId, Error, Result};

use crate::channel::{self, IoChannel};
use crate::device::resume_pending_unregister;
use crate::registry;
use crate::thread::{self, Thread};
use crate::tls;

type PerChannelFn<T> = Arc<dyn Fn(ChannelIter<T>) + Send + Sync>;
type CompletionFn<T> = Box<dyn FnOnce(T, Result<()>) + Send>;

struct Walk<T> {
    device: DeviceId,
    origin: Thread,
    snapshot: Vec<Thread>,
    cursor: usize,
    ctx: T,
    per_channel: PerChannelFn<T>,
    completion: CompletionFn<T>,
    /// Whether the walk is counted against the device
    counted: bool,
    status: Result<()>,
}

/// One step of a [`for_each_channel`] walk, handed to the per-channel
/// function on the thread that owns [`channel`](Self::channel).
///
/// The walk does not move on until [`continue_iter`](Self::continue_iter)
/// is called, which may happen later from a message or a completion. A
/// step that is dropped without continuing stalls the walk.
pub struct ChannelIter<T> {
    walk: Box<Walk<T>>,
    channel: IoChannel,
}

impl<T: Send + 'static> ChannelIter<T> {
    #[inline]
    pub fn device(&self) -> DeviceId {
        self.walk.device
    }

    /// The visited thread's channel to the device
    #[inline]
    pub fn channel(&self) -> &IoChannel {
        &self.channel
    }

    /// Thread that started the walk
    #[inline]
    pub fn origin(&self) -> &Thread {
        &self.walk.origin
    }

    #[inline]
    pub fn ctx(&self) -> &T {
        &self.walk.ctx
    }

    #[inline]
    pub fn ctx_mut(&mut self) -> &mut T {
        &mut self.walk.ctx
    }

    /// Finish this step.
    ///
    /// `Ok` moves on to the next thread; an error ends the walk and is
    /// passed to the completion.
    pub fn continue_iter(self, status: Result<()>) {
        let ChannelIter { mut walk, channel } = self;
        drop(channel);
        match status {
            Ok(()) => {
                walk.cursor += 1;
                advance(walk);
            }
            Err(err) => {
                debug!(device = %walk.device, error = %err, "for_each_channel stopped");
                walk.status = Err(err);
                finish(walk);
            }
        }
    }
}

/// Run `per_channel` once for every thread holding a channel to `device`.
///
/// The set of threads is taken now; channels opened later are not visited
/// and channels released before their turn are skipped. `completion` runs
/// on the calling thread after the last step, also when there was nothing
/// to visit, with the status that ended the walk.
///
/// A walk on an unknown device, or on one whose unregister is waiting for
/// walks to finish, completes with `DeviceNotFound` or
/// `DeviceUnregistering`.
pub fn for_each_channel<T, F, C>(device: DeviceId, ctx: T, per_channel: F, completion: C) -> Result<()>
where
    T: Send + 'static,
    F: Fn(ChannelIter<T>) + Send + Sync + 'static,
    C: FnOnce(T, Result<()>) + Send + 'static,
{
    let origin = tls::current_thread().ok_or(Error::NotOnThread)?;

    let (snapshot, status, counted) = {
        let mut reg = registry::lock();
        match reg.devices.get_mut(&device) {
            None => (Vec::new(), Err(Error::DeviceNotFound(device)), false),
            Some(rec) if rec.pending_unregister => (
                Vec::new(),
                Err(Error::DeviceUnregistering(rec.name.to_string())),
                false,
            ),
            Some(rec) => {
                rec.for_each_count += 1;
                (rec.holders.values().cloned().collect::<Vec<_>>(), Ok(()), true)
            }
        }
    };

    origin.inner.pending_iters.fetch_add(1, Ordering::AcqRel);
    debug!(device = %device, threads = snapshot.len(), origin = %origin.name(), "for_each_channel start");

    let walk = Box::new(Walk {
        device,
        origin,
        snapshot,
        cursor: 0,
        ctx,
        per_channel: Arc::new(per_channel),
        completion: Box::new(completion),
        counted,
        status,
    });

    if walk.status.is_err() {
        finish(walk);
    } else {
        advance(walk);
    }
    Ok(())
}

/// Post the walk to the next thread in the snapshot, or finish it
fn advance<T: Send + 'static>(mut walk: Box<Walk<T>>) {
    while let Some(target) = walk.snapshot.get(walk.cursor).cloned() {
        if !target.state().accepts_messages() {
            walk.cursor += 1;
            continue;
        }
        if let Err(err) = target.send_msg(move || visit(walk)) {
            error!(thread = %target.name(), error = %err, "for_each_channel walk lost");
        }
        return;
    }
    finish(walk);
}

/// Runs on a snapshot thread
fn visit<T: Send + 'static>(mut walk: Box<Walk<T>>) {
    let channel = tls::current_thread().and_then(|t| channel::lookup_local(&t, walk.device));
    match channel {
        Some(channel) => {
            trace!(device = %walk.device, thread = %channel.thread().name(), "for_each_channel visit");
            let per_channel = walk.per_channel.clone();
            per_channel(ChannelIter { walk, channel });
        }
        None => {
            trace!(device = %walk.device, "for_each_channel skipped released channel");
            walk.cursor += 1;
            advance(walk);
        }
    }
}

fn finish<T: Send + 'static>(walk: Box<Walk<T>>) {
    let origin = walk.origin.clone();
    if let Err(err) = origin.send_msg(move || complete(walk)) {
        error!(thread = %origin.name(), error = %err, "for_each_channel completion lost");
    }
}

/// Runs on the origin thread
fn complete<T: Send + 'static>(walk: Box<Walk<T>>) {
    let Walk {
        device,
        origin,
        ctx,
        completion,
        counted,
        status,
        ..
    } = *walk;

    // Set when an unregister held back by walks can now proceed
    let mut resume: Option<Option<Thread>> = None;
    if counted {
        let mut reg = registry::lock();
        if let Some(rec) = reg.devices.get_mut(&device) {
            rec.for_each_count -= 1;
            if rec.for_each_count == 0 && rec.pending_unregister {
                resume = Some(rec.unregister.as_ref().and_then(|u| u.thread.clone()));
            }
        }
    }

    origin.inner.pending_iters.fetch_sub(1, Ordering::AcqRel);
    debug!(device = %device, ok = status.is_ok(), "for_each_channel complete");
    completion(ctx, status);

    match resume {
        Some(Some(thread)) if !thread.is_current() => {
            if let Err(err) = thread.send_msg(move || resume_pending_unregister(device)) {
                error!(thread = %thread.name(), error = %err, "pending unregister lost");
            }
        }
        Some(_) => resume_pending_unregister(device),
        None => {}
    }
}

struct ThreadWalk {
    origin: Thread,
    threads: Vec<Thread>,
    cursor: usize,
    f: Arc<dyn Fn() + Send + Sync>,
    completion: Box<dyn FnOnce() + Send>,
}

/// Run `f` once on every running thread, in allocation order, then
/// `completion` on the calling thread.
pub fn for_each_thread<F, C>(f: F, completion: C) -> Result<()>
where
    F: Fn() + Send + Sync + 'static,
    C: FnOnce() + Send + 'static,
{
    let origin = tls::current_thread().ok_or(Error::NotOnThread)?;
    origin.inner.pending_iters.fetch_add(1, Ordering::AcqRel);

    let walk = Box::new(ThreadWalk {
        origin,
        threads: thread::running_threads(),
        cursor: 0,
        f: Arc::new(f),
        completion: Box::new(completion),
    });
    debug!(threads = walk.threads.len(), "for_each_thread start");
    next_thread(walk);
    Ok(())
}

fn next_thread(mut walk: Box<ThreadWalk>) {
    while let Some(target) = walk.threads.get(walk.cursor).cloned() {
        if !target.state().accepts_messages() {
            walk.cursor += 1;
            continue;
        }
        let sent = target.send_msg(move || {
            let mut walk = walk;
            (walk.f)();
            walk.cursor += 1;
            next_thread(walk);
        });
        if let Err(err) = sent {
            error!(thread = %target.name(), error = %err, "for_each_thread walk lost");
        }
        return;
    }

    let origin = walk.origin.clone();
    let sent = origin.send_msg(move || {
        let ThreadWalk {
            origin, completion, ..
        } = *walk;
        origin.inner.pending_iters.fetch_sub(1, Ordering::AcqRel);
        debug!("for_each_thread complete");
        completion();
    });
    if let Err(err) = sent {
        error!(thread = %origin.name(), error = %err, "for_each_thread completion lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{get_io_channel, put_io_channel};
    use crate::device::{io_device_exists, register_device, unregister_device, IoDevice};
    use crate::sim::SimHarness;
    use iochan_core::ThreadId;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::sync::Mutex;

    struct Counter;

    struct CounterCtx {
        visits: u32,
    }

    impl IoDevice for Counter {
        type Channel = CounterCtx;

        fn create_channel(&self) -> Result<CounterCtx> {
            Ok(CounterCtx { visits: 0 })
        }
    }

    type Log = Arc<Mutex<Vec<ThreadId>>>;

    fn open_on(sim: &mut SimHarness, id: DeviceId, threads: &[usize]) -> Vec<IoChannel> {
        threads
            .iter()
            .map(|&i| {
                sim.set_thread(i);
                get_io_channel(id).unwrap()
            })
            .collect()
    }

    fn close_all(sim: &mut SimHarness, channels: Vec<IoChannel>) {
        for ch in channels {
            put_io_channel(ch);
        }
        sim.poll_threads();
    }

    #[test]
    fn test_visits_each_thread_in_order() {
        let mut sim = SimHarness::new(3);
        let dev = Arc::new(Counter);
        let id = register_device(&dev, Some("walked")).unwrap();
        let channels = open_on(&mut sim, id, &[2, 0, 1]);

        let visited: Log = Arc::new(Mutex::new(Vec::new()));
        let done: Arc<Mutex<Vec<(ThreadId, bool)>>> = Arc::new(Mutex::new(Vec::new()));

        sim.set_thread(1);
        let v = visited.clone();
        let d = done.clone();
        for_each_channel(
            id,
            0u32,
            move |mut it: ChannelIter<u32>| {
                assert!(it.channel().thread().is_current());
                it.channel()
                    .with_ctx(|c: &mut CounterCtx| c.visits += 1)
                    .unwrap();
                v.lock().unwrap().push(tls::current_thread_id());
                *it.ctx_mut() += 1;
                it.continue_iter(Ok(()));
            },
            move |count, status| {
                assert_eq!(count, 3);
                d.lock().unwrap().push((tls::current_thread_id(), status.is_ok()));
            },
        )
        .unwrap();
        assert!(visited.lock().unwrap().is_empty());

        sim.poll_threads();
        let ids: Vec<_> = (0..3).map(|i| sim.thread(i).id()).collect();
        assert_eq!(*visited.lock().unwrap(), ids);
        assert_eq!(*done.lock().unwrap(), vec![(ids[1], true)]);

        for (i, ch) in channels.iter().enumerate() {
            sim.set_thread([2, 0, 1][i]);
            assert_eq!(ch.ctx::<CounterCtx>().unwrap().visits, 1);
        }
        close_all(&mut sim, channels);
        unregister_device(id, None).unwrap();
    }

    #[test]
    fn test_zero_channels_completes_on_next_poll() {
        let mut sim = SimHarness::new(2);
        let dev = Arc::new(Counter);
        let id = register_device(&dev, Some("empty")).unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let done = Arc::new(AtomicU32::new(0));
        sim.set_thread(0);
        let c = calls.clone();
        let d = done.clone();
        for_each_channel(
            id,
            (),
            move |it: ChannelIter<()>| {
                c.fetch_add(1, Ordering::SeqCst);
                it.continue_iter(Ok(()));
            },
            move |(), status| {
                assert!(status.is_ok());
                d.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 0);
        sim.poll_thread(0);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        unregister_device(id, None).unwrap();
    }

    #[test]
    fn test_one_step_outstanding() {
        let mut sim = SimHarness::new(3);
        let dev = Arc::new(Counter);
        let id = register_device(&dev, Some("serial")).unwrap();
        let channels = open_on(&mut sim, id, &[0, 1, 2]);

        let busy = Arc::new(AtomicBool::new(false));
        let steps = Arc::new(AtomicU32::new(0));
        sim.set_thread(0);
        let b = busy.clone();
        let s = steps.clone();
        for_each_channel(
            id,
            (),
            move |it: ChannelIter<()>| {
                assert!(!b.swap(true, Ordering::SeqCst));
                s.fetch_add(1, Ordering::SeqCst);
                // continue later, from a message on the same thread
                let b = b.clone();
                let here = it.channel().thread().clone();
                here.send_msg(move || {
                    b.store(false, Ordering::SeqCst);
                    it.continue_iter(Ok(()));
                })
                .unwrap();
            },
            |(), _| {},
        )
        .unwrap();

        sim.poll_threads();
        assert_eq!(steps.load(Ordering::SeqCst), 3);
        assert!(!busy.load(Ordering::SeqCst));
        close_all(&mut sim, channels);
        unregister_device(id, None).unwrap();
    }

    #[test]
    fn test_released_channel_skipped() {
        let mut sim = SimHarness::new(3);
        let dev = Arc::new(Counter);
        let id = register_device(&dev, Some("shrinking")).unwrap();
        let mut channels = open_on(&mut sim, id, &[0, 1, 2]);

        let visited: Log = Arc::new(Mutex::new(Vec::new()));
        sim.set_thread(0);
        let v = visited.clone();
        for_each_channel(
            id,
            (),
            move |it: ChannelIter<()>| {
                v.lock().unwrap().push(tls::current_thread_id());
                it.continue_iter(Ok(()));
            },
            |(), status| assert!(status.is_ok()),
        )
        .unwrap();

        // thread 2 drops its channel before the walk reaches it
        let last = channels.pop().unwrap();
        sim.set_thread(2);
        put_io_channel(last);

        sim.poll_threads();
        assert_eq!(
            *visited.lock().unwrap(),
            vec![sim.thread(0).id(), sim.thread(1).id()]
        );
        close_all(&mut sim, channels);
        unregister_device(id, None).unwrap();
    }

    #[test]
    fn test_later_channel_not_visited() {
        let mut sim = SimHarness::new(2);
        let dev = Arc::new(Counter);
        let id = register_device(&dev, Some("growing")).unwrap();
        let mut channels = open_on(&mut sim, id, &[0]);

        let visits = Arc::new(AtomicU32::new(0));
        sim.set_thread(0);
        let v = visits.clone();
        for_each_channel(
            id,
            (),
            move |it: ChannelIter<()>| {
                v.fetch_add(1, Ordering::SeqCst);
                it.continue_iter(Ok(()));
            },
            |(), _| {},
        )
        .unwrap();

        channels.extend(open_on(&mut sim, id, &[1]));
        sim.poll_threads();
        assert_eq!(visits.load(Ordering::SeqCst), 1);
        close_all(&mut sim, channels);
        unregister_device(id, None).unwrap();
    }

    #[test]
    fn test_error_stops_walk() {
        let mut sim = SimHarness::new(3);
        let dev = Arc::new(Counter);
        let id = register_device(&dev, Some("failing")).unwrap();
        let channels = open_on(&mut sim, id, &[0, 1, 2]);

        let visits = Arc::new(AtomicU32::new(0));
        let result = Arc::new(Mutex::new(None));
        sim.set_thread(0);
        let v = visits.clone();
        let r = result.clone();
        for_each_channel(
            id,
            (),
            move |it: ChannelIter<()>| {
                let n = v.fetch_add(1, Ordering::SeqCst);
                if n == 1 {
                    it.continue_iter(Err(Error::Module("quiesce failed".into())));
                } else {
                    it.continue_iter(Ok(()));
                }
            },
            move |(), status| {
                *r.lock().unwrap() = Some(status.map_err(|e| e.to_string()));
            },
        )
        .unwrap();

        sim.poll_threads();
        assert_eq!(visits.load(Ordering::SeqCst), 2);
        assert_eq!(
            *result.lock().unwrap(),
            Some(Err("quiesce failed".to_string()))
        );
        close_all(&mut sim, channels);
        unregister_device(id, None).unwrap();
    }

    #[test]
    fn test_unknown_device() {
        let mut sim = SimHarness::new(1);
        sim.set_thread(0);
        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        for_each_channel(
            DeviceId::from_addr(0xdead),
            (),
            |it: ChannelIter<()>| it.continue_iter(Ok(())),
            move |(), status| *r.lock().unwrap() = Some(status),
        )
        .unwrap();
        sim.poll_threads();
        assert!(matches!(
            result.lock().unwrap().as_ref(),
            Some(Err(Error::DeviceNotFound(_)))
        ));
    }

    #[test]
    fn test_requires_thread() {
        let _sim = SimHarness::new(1);
        let err = for_each_channel(
            DeviceId::from_addr(1),
            (),
            |it: ChannelIter<()>| it.continue_iter(Ok(())),
            |(), _| {},
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotOnThread));
    }

    #[test]
    fn test_unregister_waits_for_walk() {
        let mut sim = SimHarness::new(3);
        let dev = Arc::new(Counter);
        let id = register_device(&dev, Some("busy")).unwrap();
        let channels = open_on(&mut sim, id, &[0, 1]);

        let walk_done = Arc::new(AtomicBool::new(false));
        let unregistered = Arc::new(AtomicU32::new(0));

        sim.set_thread(0);
        let wd = walk_done.clone();
        for_each_channel(
            id,
            (),
            |it: ChannelIter<()>| it.continue_iter(Ok(())),
            move |(), _| wd.store(true, Ordering::SeqCst),
        )
        .unwrap();

        sim.set_thread(2);
        let u = unregistered.clone();
        unregister_device(id, Some(Box::new(move || {
            assert!(tls::current_thread_id() != ThreadId::NONE);
            u.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();

        // new walks are refused while the unregister is pending
        let refused = Arc::new(Mutex::new(None));
        let r = refused.clone();
        for_each_channel(
            id,
            (),
            |it: ChannelIter<()>| it.continue_iter(Ok(())),
            move |(), status| *r.lock().unwrap() = Some(status),
        )
        .unwrap();

        sim.poll_threads();
        assert!(walk_done.load(Ordering::SeqCst));
        assert!(matches!(
            refused.lock().unwrap().as_ref(),
            Some(Err(Error::DeviceUnregistering(_)))
        ));
        assert_eq!(unregistered.load(Ordering::SeqCst), 0);

        close_all(&mut sim, channels);
        assert_eq!(unregistered.load(Ordering::SeqCst), 1);
        assert!(!io_device_exists(id));
    }

    #[test]
    fn test_for_each_thread() {
        let mut sim = SimHarness::new(3);
        let visited: Log = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Mutex::new(None));

        sim.set_thread(2);
        let v = visited.clone();
        let d = done.clone();
        for_each_thread(
            move || v.lock().unwrap().push(tls::current_thread_id()),
            move || *d.lock().unwrap() = Some(tls::current_thread_id()),
        )
        .unwrap();

        sim.poll_threads();
        let ids: Vec<_> = (0..3).map(|i| sim.thread(i).id()).collect();
        assert_eq!(*visited.lock().unwrap(), ids);
        assert_eq!(*done.lock().unwrap(), Some(ids[2]));
    }

    #[test]
    fn test_walk_delays_thread_exit() {
        let mut sim = SimHarness::new(2);
        let dev = Arc::new(Counter);
        let id = register_device(&dev, Some("exit")).unwrap();
        let channels = open_on(&mut sim, id, &[1]);

        sim.set_thread(0);
        for_each_channel(
            id,
            (),
            |it: ChannelIter<()>| it.continue_iter(Ok(())),
            |(), _| {},
        )
        .unwrap();
        sim.thread(0).exit();
        sim.poll_thread(0);
        assert!(!sim.thread(0).is_exited());

        sim.poll_threads();
        assert!(sim.thread(0).is_exited());
        close_all(&mut sim, channels);
        sim.set_thread(1);
        unregister_device(id, None).unwrap();
    }
}
