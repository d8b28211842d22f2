//! GroupQuery state machine and its driver

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::messages::{QuerySnapshot, RespondAllTemperatures};
use crate::device::{DeviceCommand, RespondTemperature};
use crate::domain::{DeviceId, RequestId, TemperatureReading};
use crate::lifecycle::{ActorId, DeathWatch, ReplyTo};

/// One in-flight group query
///
/// Every device of the snapshot starts out pending. Each device resolves at
/// most once: the first reading or termination observed for it wins and later
/// events for it are ignored. When the deadline fires, everything still
/// pending becomes [`TemperatureReading::TimedOut`].
#[derive(Debug)]
pub struct GroupQuery {
    request_id: RequestId,
    devices: HashMap<ActorId, DeviceId>,
    pending: HashSet<DeviceId>,
    temperatures: BTreeMap<DeviceId, TemperatureReading>,
}

impl GroupQuery {
    /// Start tracking `snapshot` with every device pending
    pub fn new(request_id: RequestId, snapshot: &QuerySnapshot) -> Self {
        Self {
            request_id,
            devices: snapshot
                .iter()
                .map(|(device_id, handle)| (handle.id(), device_id.clone()))
                .collect(),
            pending: snapshot.keys().cloned().collect(),
            temperatures: BTreeMap::new(),
        }
    }

    /// Devices that have not resolved yet
    pub fn pending(&self) -> &HashSet<DeviceId> {
        &self.pending
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Fold a device's answer into the result
    ///
    /// Returns false when the answer was ignored: unknown sender, another
    /// request id, or a device that already resolved.
    pub fn reading_received(&mut self, reading: RespondTemperature) -> bool {
        if reading.request_id != self.request_id {
            debug!(
                request_id = self.request_id,
                got = reading.request_id,
                "GroupQuery: ignoring reading for another request"
            );
            return false;
        }
        self.resolve(reading.from, TemperatureReading::from_value(reading.value))
    }

    /// Record that a device stopped before answering
    pub fn device_terminated(&mut self, actor_id: ActorId) -> bool {
        self.resolve(actor_id, TemperatureReading::DeviceNotAvailable)
    }

    /// Time out every device still pending
    pub fn deadline_reached(&mut self) {
        if !self.pending.is_empty() {
            warn!(
                request_id = self.request_id,
                pending = self.pending.len(),
                "GroupQuery: deadline reached with devices still pending"
            );
        }
        for device_id in self.pending.drain() {
            self.temperatures.insert(device_id, TemperatureReading::TimedOut);
        }
    }

    /// Consume the query into its aggregated reply
    pub fn finish(mut self) -> RespondAllTemperatures {
        // Only reachable with pending devices if the caller skipped the deadline.
        self.deadline_reached();
        debug_assert_eq!(self.temperatures.len(), self.devices.len());
        RespondAllTemperatures {
            request_id: self.request_id,
            temperatures: self.temperatures,
        }
    }

    fn resolve(&mut self, actor_id: ActorId, reading: TemperatureReading) -> bool {
        let Some(device_id) = self.devices.get(&actor_id) else {
            debug!(%actor_id, "GroupQuery: ignoring event from unknown actor");
            return false;
        };
        if !self.pending.remove(device_id) {
            debug!(%device_id, ?reading, "GroupQuery: device already resolved, ignoring");
            return false;
        }
        debug!(%device_id, ?reading, remaining = self.pending.len(), "GroupQuery: device resolved");
        self.temperatures.insert(device_id.clone(), reading);
        true
    }

    /// Run a query over `snapshot` to completion
    ///
    /// Broadcasts a read to every device, watches every device for
    /// termination and returns once all devices resolved or `timeout`
    /// elapsed. Reads are enqueued without waiting, so a device with a full
    /// mailbox never delays the others. Readings are polled before
    /// terminations, so an answer sent before a device stopped is always
    /// counted as an answer.
    pub async fn run(request_id: RequestId, snapshot: QuerySnapshot, timeout: Duration) -> RespondAllTemperatures {
        debug!(request_id, devices = snapshot.len(), ?timeout, "GroupQuery::run: called");
        if snapshot.is_empty() {
            debug!(request_id, "GroupQuery::run: empty snapshot");
            return RespondAllTemperatures::empty(request_id);
        }

        let deadline = Instant::now() + timeout;
        let (reading_tx, mut reading_rx) = mpsc::channel(snapshot.len());
        let (terminated_tx, mut terminated_rx) = mpsc::channel(snapshot.len());
        let mut watch = DeathWatch::new(terminated_tx.downgrade());
        let mut query = Self::new(request_id, &snapshot);

        // Reads that did not fit a device mailbox; dropping the set aborts them.
        let mut deliveries = JoinSet::new();
        for handle in snapshot.values() {
            watch.watch(handle, handle.id());
            let read = DeviceCommand::ReadTemperature {
                request_id,
                reply_to: ReplyTo::Mailbox(reading_tx.clone()),
            };
            match handle.try_forward(read) {
                Ok(()) => {}
                Err(TrySendError::Closed(_)) => {
                    // Mailbox already closed, the device is gone.
                    query.device_terminated(handle.id());
                }
                Err(TrySendError::Full(read)) => {
                    debug!(actor_id = %handle.id(), "GroupQuery::run: device mailbox full, delivering read in background");
                    let handle = handle.clone();
                    deliveries.spawn(async move {
                        let _ = tokio::time::timeout_at(deadline, handle.forward_when_ready(read)).await;
                    });
                }
            }
        }

        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        while !query.is_complete() {
            tokio::select! {
                biased;
                Some(reading) = reading_rx.recv() => {
                    query.reading_received(reading);
                }
                Some(actor_id) = terminated_rx.recv() => {
                    query.device_terminated(actor_id);
                }
                _ = &mut sleep => {
                    query.deadline_reached();
                }
            }
        }

        drop(watch);
        drop(deliveries);
        let response = query.finish();
        info!(
            request_id,
            devices = response.temperatures.len(),
            answered = response.answered(),
            "Group query completed"
        );
        response
    }

    /// Run a query on its own task and deliver the result to `requester`
    pub fn spawn(
        request_id: RequestId,
        snapshot: QuerySnapshot,
        requester: ReplyTo<RespondAllTemperatures>,
        timeout: Duration,
    ) -> JoinHandle<()> {
        debug!(request_id, devices = snapshot.len(), "GroupQuery::spawn: called");
        tokio::spawn(async move {
            let response = Self::run(request_id, snapshot, timeout).await;
            if !requester.send(response) {
                debug!(request_id, "GroupQuery: requester went away before the reply");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCommand, DeviceHandle};
    use proptest::prelude::*;
    use tokio::sync::oneshot;

    /// A device stand-in whose mailbox the test drains by hand
    struct Probe {
        handle: DeviceHandle,
        rx: mpsc::Receiver<DeviceCommand>,
    }

    impl Probe {
        fn new() -> Self {
            let (handle, rx) = DeviceHandle::detached(4);
            Self { handle, rx }
        }

        async fn expect_read(&mut self) -> (RequestId, ReplyTo<RespondTemperature>) {
            match self.rx.recv().await {
                Some(DeviceCommand::ReadTemperature { request_id, reply_to }) => (request_id, reply_to),
                other => panic!("Expected ReadTemperature, got {:?}", other),
            }
        }

        async fn answer(&mut self, value: Option<f64>) {
            let (request_id, reply_to) = self.expect_read().await;
            let from = self.handle.id();
            reply_to.send(RespondTemperature { request_id, from, value });
        }
    }

    fn two_probes() -> (Probe, Probe, QuerySnapshot) {
        let device1 = Probe::new();
        let device2 = Probe::new();
        let mut snapshot = QuerySnapshot::new();
        snapshot.insert("device1".to_string(), device1.handle.clone());
        snapshot.insert("device2".to_string(), device2.handle.clone());
        (device1, device2, snapshot)
    }

    fn start(snapshot: QuerySnapshot, timeout: Duration) -> oneshot::Receiver<RespondAllTemperatures> {
        let (tx, rx) = oneshot::channel();
        GroupQuery::spawn(1, snapshot, ReplyTo::Caller(tx), timeout);
        rx
    }

    #[tokio::test]
    async fn test_return_temperature_value_for_working_devices() {
        let (mut device1, mut device2, snapshot) = two_probes();
        let reply = start(snapshot, Duration::from_secs(3));

        device1.answer(Some(1.0)).await;
        device2.answer(Some(2.0)).await;

        let response = reply.await.unwrap();
        assert_eq!(response.request_id, 1);
        assert_eq!(response.temperatures["device1"], TemperatureReading::Temperature(1.0));
        assert_eq!(response.temperatures["device2"], TemperatureReading::Temperature(2.0));
    }

    #[tokio::test]
    async fn test_read_request_carries_query_request_id() {
        let (mut device1, mut device2, snapshot) = two_probes();
        let _reply = start(snapshot, Duration::from_secs(3));

        assert_eq!(device1.expect_read().await.0, 1);
        assert_eq!(device2.expect_read().await.0, 1);
    }

    #[tokio::test]
    async fn test_return_not_available_for_devices_with_no_readings() {
        let (mut device1, mut device2, snapshot) = two_probes();
        let reply = start(snapshot, Duration::from_secs(3));

        device1.answer(None).await;
        device2.answer(Some(2.0)).await;

        let response = reply.await.unwrap();
        assert_eq!(response.temperatures["device1"], TemperatureReading::NotAvailable);
        assert_eq!(response.temperatures["device2"], TemperatureReading::Temperature(2.0));
    }

    #[tokio::test]
    async fn test_return_device_not_available_if_device_stops_before_answering() {
        let (mut device1, device2, snapshot) = two_probes();
        let reply = start(snapshot, Duration::from_secs(3));

        device1.answer(Some(1.0)).await;
        drop(device2.rx);

        let response = reply.await.unwrap();
        assert_eq!(response.temperatures["device1"], TemperatureReading::Temperature(1.0));
        assert_eq!(response.temperatures["device2"], TemperatureReading::DeviceNotAvailable);
    }

    #[tokio::test]
    async fn test_return_temperature_reading_even_if_device_stops_after_answering() {
        let (mut device1, mut device2, snapshot) = two_probes();
        let reply = start(snapshot, Duration::from_secs(3));

        device1.answer(Some(1.0)).await;
        device2.answer(Some(2.0)).await;
        drop(device2.rx);

        let response = reply.await.unwrap();
        assert_eq!(response.temperatures["device2"], TemperatureReading::Temperature(2.0));
    }

    #[tokio::test]
    async fn test_return_timed_out_if_device_does_not_answer_in_time() {
        let (mut device1, _device2, snapshot) = two_probes();
        let timeout = Duration::from_millis(200);
        let started = Instant::now();
        let reply = start(snapshot, timeout);

        device1.answer(Some(1.0)).await;

        let response = reply.await.unwrap();
        let elapsed = started.elapsed();
        assert_eq!(response.temperatures["device1"], TemperatureReading::Temperature(1.0));
        assert_eq!(response.temperatures["device2"], TemperatureReading::TimedOut);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_empty_snapshot_completes_immediately() {
        let response = GroupQuery::run(9, QuerySnapshot::new(), Duration::from_secs(60)).await;
        assert_eq!(response, RespondAllTemperatures::empty(9));
    }

    #[tokio::test]
    async fn test_device_already_stopped_at_start() {
        let (mut device1, device2, snapshot) = two_probes();
        drop(device2.rx);
        let reply = start(snapshot, Duration::from_secs(3));

        device1.answer(Some(1.0)).await;

        let response = reply.await.unwrap();
        assert_eq!(response.temperatures["device2"], TemperatureReading::DeviceNotAvailable);
    }

    #[test]
    fn test_first_resolution_wins() {
        let (device1, device2, snapshot) = two_probes();
        let mut query = GroupQuery::new(1, &snapshot);
        let id1 = device1.handle.id();
        let id2 = device2.handle.id();

        assert!(query.reading_received(RespondTemperature {
            request_id: 1,
            from: id1,
            value: Some(1.0),
        }));
        // Duplicate reply and late termination are both ignored.
        assert!(!query.reading_received(RespondTemperature {
            request_id: 1,
            from: id1,
            value: Some(5.0),
        }));
        assert!(!query.device_terminated(id1));

        assert!(query.device_terminated(id2));
        assert!(!query.reading_received(RespondTemperature {
            request_id: 1,
            from: id2,
            value: Some(2.0),
        }));

        assert!(query.is_complete());
        let response = query.finish();
        assert_eq!(response.temperatures["device1"], TemperatureReading::Temperature(1.0));
        assert_eq!(response.temperatures["device2"], TemperatureReading::DeviceNotAvailable);
    }

    #[test]
    fn test_ignores_foreign_events() {
        let (device1, _device2, snapshot) = two_probes();
        let mut query = GroupQuery::new(1, &snapshot);

        assert!(!query.reading_received(RespondTemperature {
            request_id: 2,
            from: device1.handle.id(),
            value: Some(1.0),
        }));
        assert!(!query.device_terminated(ActorId::new()));
        assert_eq!(query.pending().len(), 2);
    }

    #[test]
    fn test_deadline_times_out_pending_devices_only() {
        let (device1, _device2, snapshot) = two_probes();
        let mut query = GroupQuery::new(1, &snapshot);
        query.reading_received(RespondTemperature {
            request_id: 1,
            from: device1.handle.id(),
            value: None,
        });

        query.deadline_reached();
        assert!(query.is_complete());

        let response = query.finish();
        assert_eq!(response.temperatures["device1"], TemperatureReading::NotAvailable);
        assert_eq!(response.temperatures["device2"], TemperatureReading::TimedOut);
    }

    #[tokio::test]
    async fn test_busy_device_does_not_delay_others() {
        // A device whose only mailbox slot is already taken and never drained
        let (busy, _busy_rx) = DeviceHandle::detached(1);
        busy.try_forward(DeviceCommand::Stop).unwrap();

        let mut snapshot = QuerySnapshot::new();
        snapshot.insert("busy".to_string(), busy);
        for i in 0..8 {
            let device = DeviceHandle::spawn("group", &format!("device{}", i), 4);
            device.record_temperature(0, 1.0).await.unwrap();
            snapshot.insert(format!("device{}", i), device);
        }

        let response = GroupQuery::run(5, snapshot, Duration::from_millis(200)).await;

        assert_eq!(response.temperatures.len(), 9);
        assert_eq!(response.temperatures["busy"], TemperatureReading::TimedOut);
        for i in 0..8 {
            assert_eq!(
                response.temperatures[&format!("device{}", i)],
                TemperatureReading::Temperature(1.0)
            );
        }
    }

    /// What a simulated device does with the read request
    #[derive(Debug, Clone)]
    enum Behavior {
        Answer(Option<f64>),
        AnswerTwice(Option<f64>, Option<f64>),
        AnswerThenStop(Option<f64>),
        Stop,
        Silent,
    }

    impl Behavior {
        fn expected(&self) -> TemperatureReading {
            match self {
                Self::Answer(value) | Self::AnswerTwice(value, _) | Self::AnswerThenStop(value) => {
                    TemperatureReading::from_value(*value)
                }
                Self::Stop => TemperatureReading::DeviceNotAvailable,
                Self::Silent => TemperatureReading::TimedOut,
            }
        }
    }

    fn arb_value() -> impl Strategy<Value = Option<f64>> {
        prop_oneof![Just(None), (-40.0f64..60.0).prop_map(Some)]
    }

    fn arb_behavior() -> impl Strategy<Value = Behavior> {
        prop_oneof![
            arb_value().prop_map(Behavior::Answer),
            (arb_value(), arb_value()).prop_map(|(a, b)| Behavior::AnswerTwice(a, b)),
            arb_value().prop_map(Behavior::AnswerThenStop),
            Just(Behavior::Stop),
            Just(Behavior::Silent),
        ]
    }

    async fn simulate(mut probe: Probe, behavior: Behavior) {
        let from = probe.handle.id();
        let (request_id, reply_to) = match probe.rx.recv().await {
            Some(DeviceCommand::ReadTemperature { request_id, reply_to }) => (request_id, reply_to),
            _ => return,
        };
        match behavior {
            Behavior::Answer(value) => {
                reply_to.send(RespondTemperature { request_id, from, value });
                // Stay alive until the query is torn down.
                while probe.rx.recv().await.is_some() {}
            }
            Behavior::AnswerTwice(first, second) => {
                if let ReplyTo::Mailbox(tx) = reply_to {
                    let _ = tx.send(RespondTemperature { request_id, from, value: first }).await;
                    let _ = tx.send(RespondTemperature { request_id, from, value: second }).await;
                }
                while probe.rx.recv().await.is_some() {}
            }
            Behavior::AnswerThenStop(value) => {
                reply_to.send(RespondTemperature { request_id, from, value });
            }
            Behavior::Stop => {}
            Behavior::Silent => {
                drop(reply_to);
                while probe.rx.recv().await.is_some() {}
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// The reply covers exactly the snapshot and each device gets the status its behavior implies.
        #[test]
        fn result_matches_device_behaviors(behaviors in proptest::collection::vec(arb_behavior(), 0..6)) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();

            let response = runtime.block_on(async {
                let mut snapshot = QuerySnapshot::new();
                let mut probes = Vec::new();
                for (i, behavior) in behaviors.iter().enumerate() {
                    let probe = Probe::new();
                    snapshot.insert(format!("device{}", i), probe.handle.clone());
                    probes.push((probe, behavior.clone()));
                }
                let (tx, rx) = oneshot::channel();
                GroupQuery::spawn(3, snapshot, ReplyTo::Caller(tx), Duration::from_millis(250));
                let workers: Vec<_> = probes
                    .into_iter()
                    .map(|(probe, behavior)| tokio::spawn(simulate(probe, behavior)))
                    .collect();
                let response = rx.await.unwrap();
                for worker in workers {
                    worker.abort();
                }
                response
            });

            prop_assert_eq!(response.request_id, 3);
            prop_assert_eq!(response.temperatures.len(), behaviors.len());
            for (i, behavior) in behaviors.iter().enumerate() {
                let device_id = format!("device{}", i);
                prop_assert_eq!(response.temperatures.get(&device_id).copied(), Some(behavior.expected()));
            }
        }
    }

}
