use std::iter::Iterator;
use std::panic;
use std::thread;

pub type Sender<T> = crossbeam_channel::Sender<T>;
pub type Receiver<T> = crossbeam_channel::Receiver<T>;

/// Marshall the output of parallel jobs in sequence to a serial consumer
///
/// Each job runs on its own scoped OS thread and may finish in any order.
/// The consumer runs on one further thread and sees the outputs strictly in
/// the order the jobs were yielded by `jobs`.
///
/// At any time the number of running jobs plus the number of outputs waiting
/// to be consumed is at most `max_inflight` (treated as 1 when 0 is given).
///
/// Returns the number of outputs consumed. A panic in the consumer is
/// re-raised on the calling thread once the running jobs have finished.
pub fn seq_rw_marshall<D, I, C>(jobs: I, consumer: C, max_inflight: usize) -> usize
where
    I: Iterator,
    I::Item: FnOnce() -> D + Send,
    C: FnMut(D) + Send,
    D: Send,
{
    let max_inflight = max_inflight.max(1);
    let mut jobs = jobs.fuse();
    let mut consumer = consumer;

    //Ordering: job result channels are queued on `pending` in spawn order,
    //  and the consumer drains `pending` as a FIFO, blocking on each
    //  job's own channel in turn.
    //
    //After each output has been consumed a () is sent on the ack channel
    //  so that the main loop may spawn another job.
    thread::scope(|ts| {
        let (pending_s, pending_r) = crossbeam_channel::unbounded::<Receiver<D>>();
        let (ack_s, ack_r) = crossbeam_channel::unbounded::<()>();

        let consumer_thread = ts.spawn(move || {
            let mut consumed = 0usize;
            for ch in pending_r {
                // a job that panicked drops its sender without sending
                let Ok(out) = ch.recv() else { break };
                consumer(out);
                consumed += 1;
                if ack_s.send(()).is_err() {
                    break;
                }
            }
            consumed
        });

        let mut inflight = 0usize;
        loop {
            while inflight < max_inflight {
                let Some(job) = jobs.next() else { break };
                let (s, r) = crossbeam_channel::bounded::<D>(1);
                ts.spawn(move || {
                    let _ = s.send(job());
                });
                if pending_s.send(r).is_err() {
                    break;
                }
                inflight += 1;
            }
            if inflight == 0 {
                break;
            }
            if ack_r.recv().is_err() {
                break;
            }
            inflight -= 1;
        }
        drop(pending_s);
        match consumer_thread.join() {
            Ok(consumed) => consumed,
            Err(payload) => panic::resume_unwind(payload),
        }
    })
}
