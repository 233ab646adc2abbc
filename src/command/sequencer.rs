//! Request sequencing
//!
//! One actor task owns the FIFO queue. The head of the queue runs as a
//! future polled inside the actor's `select!`, so exactly one queued request
//! is in flight while new frames keep arriving. Requests that bypass the
//! queue each run as their own task and may overlap the in-flight request
//! and one another.

use super::executor::{CommandExecutor, Dispatched, FollowUp};
use super::Request;
use futures::future::{BoxFuture, FutureExt, OptionFuture};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Cheap handle used by WebSocket sessions to submit requests
#[derive(Clone)]
pub struct SequencerHandle {
    requests: mpsc::UnboundedSender<Request>,
    control: mpsc::UnboundedSender<oneshot::Sender<()>>,
    next_msg_id: Arc<AtomicU64>,
}

impl SequencerHandle {
    pub fn next_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Hand a request to the sequencer
    ///
    /// Gives the request back once the sequencer has stopped.
    pub fn submit(&self, request: Request) -> Result<(), Request> {
        self.requests.send(request).map_err(|e| e.0)
    }

    /// Stop the sequencer and wait until every request is answered
    pub async fn stop(&self) {
        let (ack, done) = oneshot::channel();
        if self.control.send(ack).is_ok() {
            let _ = done.await;
        }
    }
}

/// Spawn the sequencer actor
///
/// `terminate` is flipped on stop so that in-flight device waits return.
pub fn spawn(
    executor: CommandExecutor,
    terminate: watch::Sender<bool>,
) -> (SequencerHandle, JoinHandle<()>) {
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    let sequencer = Sequencer {
        executor,
        terminate,
        queue: VecDeque::new(),
        bypass: JoinSet::new(),
    };
    let task = tokio::spawn(sequencer.run(requests_rx, control_rx));

    let handle = SequencerHandle {
        requests: requests_tx,
        control: control_tx,
        next_msg_id: Arc::new(AtomicU64::new(1)),
    };
    (handle, task)
}

struct Sequencer {
    executor: CommandExecutor,
    terminate: watch::Sender<bool>,
    queue: VecDeque<Request>,
    /// Requests running outside the queue
    bypass: JoinSet<Dispatched>,
}

impl Sequencer {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut control: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    ) {
        let mut in_flight: Option<BoxFuture<'static, Dispatched>> = None;

        loop {
            if in_flight.is_none() {
                if let Some(request) = self.queue.pop_front() {
                    let executor = self.executor.clone();
                    in_flight = Some(async move { executor.execute(request).await }.boxed());
                }
            }

            tokio::select! {
                Some(done) = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                    in_flight = None;
                    self.finish(done);
                }
                Some(joined) = self.bypass.join_next(), if !self.bypass.is_empty() => {
                    self.finish_bypass(joined);
                }
                request = requests.recv() => match request {
                    Some(request) => self.accept(request),
                    None => {
                        self.shutdown(in_flight.take(), &mut requests).await;
                        return;
                    }
                },
                Some(ack) = control.recv() => {
                    self.shutdown(in_flight.take(), &mut requests).await;
                    let _ = ack.send(());
                    // Late stop calls find the actor gone and return at once
                    return;
                }
            }
        }
    }

    fn accept(&mut self, request: Request) {
        if !request.bypasses_queue() {
            debug!("[CMD] Queued comm={} ({} waiting)", request.comm_id, self.queue.len());
            self.queue.push_back(request);
            return;
        }

        debug!("[CMD] Running comm={} outside the queue", request.comm_id);
        let executor = self.executor.clone();
        self.bypass.spawn(async move { executor.execute(request).await });
    }

    fn finish(&mut self, done: Dispatched) {
        let Dispatched {
            mut request,
            follow_up,
        } = done;

        if !request.respond() && !request.origin.is_alive() {
            debug!("[CMD] Origin of comm={} gone, response dropped", request.comm_id);
        }
        if follow_up == FollowUp::DrainQueue {
            self.drain_queue();
        }
    }

    fn finish_bypass(&mut self, joined: Result<Dispatched, JoinError>) {
        match joined {
            Ok(done) => self.finish(done),
            // The request went down with its task and cannot be answered
            Err(e) => warn!("[CMD] Request task ended abnormally: {}", e),
        }
    }

    /// Answer every queued request with a rejection
    fn drain_queue(&mut self) -> usize {
        let drained = self.queue.len();
        for mut request in self.queue.drain(..) {
            request.reject();
            request.respond();
        }
        if drained > 0 {
            info!("[CMD] Rejected {} queued requests", drained);
        }
        drained
    }

    async fn shutdown(
        &mut self,
        in_flight: Option<BoxFuture<'static, Dispatched>>,
        requests: &mut mpsc::UnboundedReceiver<Request>,
    ) {
        info!("[CMD] Sequencer stopping");
        self.terminate.send_replace(true);
        requests.close();

        if let Some(in_flight) = in_flight {
            let done = in_flight.await;
            self.finish(done);
        }

        while let Ok(request) = requests.try_recv() {
            self.queue.push_back(request);
        }
        self.drain_queue();

        // Running bypass requests finish against the raised terminate flag
        while let Some(joined) = self.bypass.join_next().await {
            self.finish_bypass(joined);
        }
        info!("[CMD] Sequencer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::Harness;
    use crate::device::testing::FakeDevice;
    use gateway_shared::Response;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    async fn next(rx: &mut UnboundedReceiver<Response>) -> Response {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("response in time")
            .expect("peer channel open")
    }

    #[tokio::test]
    async fn test_queue_is_fifo_across_peers() {
        let mut harness = Harness::new().await;
        harness.connect().await;
        let (sequencer, _task) = harness.sequencer();

        let (a, mut a_rx) = harness.request("1:tello:sync:first").await;
        let (b, mut b_rx) = harness.request("2:tello:sync:second").await;
        let (c, mut c_rx) = harness.request("3:tello:sync:third").await;
        sequencer.submit(a).unwrap();
        sequencer.submit(b).unwrap();
        sequencer.submit(c).unwrap();

        assert_eq!(next(&mut a_rx).await, Response::new(1, true, "ok"));
        assert_eq!(next(&mut b_rx).await, Response::new(2, true, "ok"));
        assert_eq!(next(&mut c_rx).await, Response::new(3, true, "ok"));
        assert_eq!(
            harness.device.received().await,
            vec!["first", "second", "third"]
        );
    }

    #[tokio::test]
    async fn test_async_bypasses_in_flight_sync() {
        let mut harness = Harness::new().await;
        harness.connect().await;
        let (sequencer, _task) = harness.sequencer();

        let (slow, mut slow_rx) = harness.request("1:tello:sync:silent").await;
        let (fast, mut fast_rx) = harness.request("2:tello:async:emergency").await;
        sequencer.submit(slow).unwrap();
        sequencer.submit(fast).unwrap();

        let response = timeout(Duration::from_millis(500), fast_rx.recv())
            .await
            .expect("async answered while sync is in flight")
            .unwrap();
        assert_eq!(response, Response::new(2, true, "send as async"));
        assert!(slow_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_rejects_queue_and_answers_in_flight() {
        let mut harness = Harness::new().await;
        harness.connect().await;
        let (sequencer, task) = harness.sequencer();

        let (slow, mut slow_rx) = harness.request("1:tello:sync:silent").await;
        sequencer.submit(slow).unwrap();

        let mut queued = Vec::new();
        for comm_id in 2..5 {
            let (req, rx) = harness
                .request(&format!("{}:tello:sync:takeoff", comm_id))
                .await;
            sequencer.submit(req).unwrap();
            queued.push((comm_id, rx));
        }

        // Let the first request reach the device
        tokio::time::sleep(Duration::from_millis(100)).await;
        timeout(Duration::from_secs(1), sequencer.stop())
            .await
            .expect("stop does not wait for the response timeout");

        let in_flight = next(&mut slow_rx).await;
        assert_eq!(in_flight.comm_id, 1);
        assert!(!in_flight.result);

        for (comm_id, mut rx) in queued {
            assert_eq!(next(&mut rx).await, Response::rejected(comm_id));
        }
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_stop_is_refused() {
        let mut harness = Harness::new().await;
        let (sequencer, task) = harness.sequencer();

        sequencer.stop().await;
        task.await.unwrap();

        let (req, _rx) = harness.request("1:module:sync:isAlive").await;
        let refused = sequencer.submit(req).unwrap_err();
        assert_eq!(refused.comm_id, 1);
    }

    #[tokio::test]
    async fn test_reset_drains_queue() {
        let mut harness = Harness::new().await;
        harness.connect().await;
        let (sequencer, _task) = harness.sequencer();

        let (slow, mut slow_rx) = harness.request("1:tello:sync:silent").await;
        let (queued, mut queued_rx) = harness.request("2:tello:sync:land").await;
        let (reset, mut reset_rx) = harness.request("3:module:async:reset").await;
        sequencer.submit(slow).unwrap();
        sequencer.submit(queued).unwrap();
        sequencer.submit(reset).unwrap();

        assert_eq!(next(&mut reset_rx).await, Response::new(3, true, "ok"));
        assert_eq!(next(&mut queued_rx).await, Response::rejected(2));

        // The in-flight request is not cancelled by a reset
        assert!(slow_rx.try_recv().is_err());
        assert!(!harness.device.received().await.contains(&"land".to_string()));
    }

    #[tokio::test]
    async fn test_client_notify_reaches_every_peer() {
        let mut harness = Harness::new().await;
        let (sequencer, _task) = harness.sequencer();

        let (_listener, mut listener_rx) = harness.peers.register().await;
        let (notify, mut origin_rx) = harness.request("77:client:sync:green flag").await;
        sequencer.submit(notify).unwrap();

        let expected = Response::new(0, true, "green flag");
        assert_eq!(next(&mut origin_rx).await, expected);
        assert_eq!(next(&mut listener_rx).await, expected);
        assert!(origin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_origin_does_not_stall_queue() {
        let mut harness = Harness::new().await;
        harness.connect().await;
        let (sequencer, _task) = harness.sequencer();

        let (gone, gone_rx) = harness.request("1:tello:sync:first").await;
        drop(gone_rx);
        let (live, mut live_rx) = harness.request("2:tello:sync:second").await;
        sequencer.submit(gone).unwrap();
        sequencer.submit(live).unwrap();

        assert_eq!(next(&mut live_rx).await, Response::new(2, true, "ok"));
    }

    #[tokio::test]
    async fn test_slow_bypass_does_not_delay_other_bypass() {
        let mut harness = Harness::new().await;
        harness.connect().await;
        let (sequencer, _task) = harness.sequencer();

        let (pop, mut pop_rx) = harness.request("1:module:async:popResponse 1500").await;
        let (stop, mut stop_rx) = harness.request("2:tello:async:emergency").await;
        sequencer.submit(pop).unwrap();
        sequencer.submit(stop).unwrap();

        let response = timeout(Duration::from_millis(500), stop_rx.recv())
            .await
            .expect("emergency answered while popResponse waits")
            .unwrap();
        assert_eq!(response, Response::new(2, true, "send as async"));
        assert!(harness.device.received().await.contains(&"emergency".to_string()));
        assert!(pop_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_async_reply_is_not_returned_to_next_sync() {
        let mut harness = Harness::new().await;
        harness.connect().await;
        let (sequencer, _task) = harness.sequencer();

        let (takeoff, mut takeoff_rx) = harness.request("1:tello:async:takeoff").await;
        sequencer.submit(takeoff).unwrap();
        assert_eq!(next(&mut takeoff_rx).await, Response::new(1, true, "send as async"));

        let (battery, mut battery_rx) = harness.request("2:tello:sync:battery?").await;
        sequencer.submit(battery).unwrap();
        assert_eq!(next(&mut battery_rx).await, Response::new(2, true, "87"));
    }

    #[tokio::test]
    async fn test_reply_for_departed_peer_is_not_returned_to_next() {
        let mut harness = Harness::new().await;
        harness.connect().await;
        let (sequencer, _task) = harness.sequencer();

        let (gone, gone_rx) = harness.request("1:tello:sync:battery?").await;
        drop(gone_rx);
        let (speed, mut speed_rx) = harness.request("2:tello:sync:speed?").await;
        sequencer.submit(gone).unwrap();
        sequencer.submit(speed).unwrap();

        assert_eq!(next(&mut speed_rx).await, Response::new(2, true, "10"));
    }

    #[tokio::test]
    async fn test_reply_reaches_origin_before_next_send() {
        let first_rx: Arc<StdMutex<Option<UnboundedReceiver<Response>>>> = Arc::default();
        let delivered_first = Arc::new(StdMutex::new(None));
        let (slot, seen) = (first_rx.clone(), delivered_first.clone());

        // On the second command, check the first response is already queued
        let device = FakeDevice::spawn(move |cmd| {
            if cmd == "battery?" {
                let delivered = slot.lock().unwrap().as_mut().map(|rx| rx.try_recv().is_ok());
                *seen.lock().unwrap() = delivered;
                return vec!["87".to_string()];
            }
            vec!["ok".to_string()]
        })
        .await;
        let mut harness = Harness::with_device(device);
        harness.connect().await;
        let (sequencer, _task) = harness.sequencer();

        let (handshake, rx) = harness.request("1:tello:sync:command").await;
        *first_rx.lock().unwrap() = Some(rx);
        let (battery, mut battery_rx) = harness.request("2:tello:sync:battery?").await;
        sequencer.submit(handshake).unwrap();
        sequencer.submit(battery).unwrap();

        assert_eq!(next(&mut battery_rx).await, Response::new(2, true, "87"));
        assert_eq!(*delivered_first.lock().unwrap(), Some(true));
    }
}
