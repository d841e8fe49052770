/*!
Event fixtures

Each builder is bound to one probe identity and produces distinct,
increasing samples so ordering assertions are meaningful.
*/

use diskbeat_protocol::{HeartbeatEvent, HeartbeatTime, Resource, Sample, TelemetryEvent};

pub struct EventBuilder {
    probe_id: String,
    chunk_size: u64,
    counter: u64,
}

impl EventBuilder {
    pub fn new<S: Into<String>>(probe_id: S) -> Self {
        Self {
            probe_id: probe_id.into(),
            chunk_size: 10_000_000,
            counter: 0,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn probe_id(&self) -> &str {
        &self.probe_id
    }

    /// Next sample in the sequence; `operation_time` grows with every call
    pub fn sample(&mut self) -> TelemetryEvent {
        self.counter += 1;
        let file_size = self.chunk_size * 2;
        let operation_time = self.counter as f64 * 0.25;
        TelemetryEvent::sample(
            self.probe_id.clone(),
            Sample {
                operation_time,
                file_size,
                chunk_size: self.chunk_size,
                write_speed: format!("{}bytes/sec", (file_size as f64 / operation_time) as u64),
            },
        )
    }

    pub fn samples(&mut self, count: usize) -> Vec<TelemetryEvent> {
        (0..count).map(|_| self.sample()).collect()
    }

    pub fn resource<C: Into<String>, M: Into<String>>(&self, cpu: C, mem: M) -> TelemetryEvent {
        TelemetryEvent::resource(
            self.probe_id.clone(),
            Resource {
                cpu: cpu.into(),
                mem: mem.into(),
            },
        )
    }

    pub fn heartbeat(&self, epoch_secs: f64) -> HeartbeatEvent {
        HeartbeatEvent::new(self.probe_id.clone(), HeartbeatTime::Epoch(epoch_secs))
    }

    /// Heartbeat with the readable time a probe sends first
    pub fn first_heartbeat(&self) -> HeartbeatEvent {
        let now = chrono::Utc::now().format("%a %b %e %H:%M:%S %Y").to_string();
        HeartbeatEvent::new(self.probe_id.clone(), HeartbeatTime::Text(now))
    }

    /// The reference measurement: 20 MB in 1.23 s with 10 MB chunks
    pub fn reference_sample(probe_id: &str) -> TelemetryEvent {
        TelemetryEvent::sample(
            probe_id,
            Sample {
                operation_time: 1.23,
                file_size: 20_000_000,
                chunk_size: 10_000_000,
                write_speed: "8000000bytes/sec".to_string(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskbeat_protocol::Payload;

    #[test]
    fn test_samples_are_distinct_and_ordered() {
        let mut builder = EventBuilder::new("probe-1").with_chunk_size(1000);
        let samples = builder.samples(3);
        let times: Vec<f64> = samples
            .iter()
            .filter_map(|e| match e.payload() {
                Payload::Sample(s) => Some(s.operation_time),
                Payload::Resource(_) => None,
            })
            .collect();
        assert_eq!(times, vec![0.25, 0.5, 0.75]);
        assert!(samples.iter().all(|e| e.probe_id() == "probe-1"));
    }

    #[test]
    fn test_heartbeat_fixtures_encode() {
        let builder = EventBuilder::new("probe-1");
        let bytes = builder.first_heartbeat().encode().unwrap();
        let decoded = HeartbeatEvent::decode(&bytes).unwrap();
        assert!(matches!(decoded.time, HeartbeatTime::Text(_)));
        let json: serde_json::Value = serde_json::from_slice(&builder.heartbeat(1.5).encode().unwrap()).unwrap();
        assert_eq!(json["heartbeat"]["id"], "probe-1");
        assert_eq!(json["heartbeat"]["time"], 1.5);
    }
}
