// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Subtimeslice builder: at every timeslice boundary, cut one component
// out of every channel and hand the assembled subtimeslice to the
// sender. Channels that cannot deliver in time are left out and the
// subtimeslice is flagged incomplete. Completions coming back from the
// sender advance the channel read pointers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::channel::{Channel, ChannelError, ChannelState};
use crate::monitor::Monitor;
use crate::sender::SenderHandle;
use crate::subtimeslice::{st_flags, StId, SubTimesliceHandle};
use crate::system::{current_time_ns, StopToken};
use crate::timer::TaskQueue;

/// Ring utilisation above which pending subtimeslices are retracted.
const RETRACT_UTILIZATION: f32 = 0.9;

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Identity of this sender process for registration and telemetry.
#[derive(Debug, Clone)]
pub struct SenderInfo {
    pub address: String,
    pub port: u16,
}

impl SenderInfo {
    pub fn id(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Default)]
struct Stats {
    timeslice_count: u64,
    component_count: u64,
    microslice_count: u64,
    data_bytes: u64,
    timeslice_incomplete_count: u64,
}

enum BuilderTask {
    ReportStatus,
}

/// The per-process subtimeslice construction loop.
pub struct StBuilder {
    channels: Vec<Channel>,
    st_sender: SenderHandle,
    sender_info: SenderInfo,
    monitor: Option<Arc<Monitor>>,
    timeslice_duration_ns: u64,
    timeout_ns: u64,
    overlap_after_ns: u64,
    completed: BTreeMap<StId, bool>,
    stats: Stats,
    tasks: TaskQueue<BuilderTask>,
    started_at: Instant,
}

impl StBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channels: Vec<Channel>,
        st_sender: SenderHandle,
        sender_info: SenderInfo,
        monitor: Option<Arc<Monitor>>,
        timeslice_duration_ns: u64,
        timeout_ns: u64,
        overlap_after_ns: u64,
    ) -> Self {
        assert!(timeslice_duration_ns > 0);
        Self {
            channels,
            st_sender,
            sender_info,
            monitor,
            timeslice_duration_ns,
            timeout_ns,
            overlap_after_ns,
            completed: BTreeMap::new(),
            stats: Stats::default(),
            tasks: TaskQueue::new(),
            started_at: Instant::now(),
        }
    }

    pub fn run(&mut self, stop: &StopToken) -> Result<(), ChannelError> {
        // Discard everything produced before the pipeline came up.
        for channel in &mut self.channels {
            channel.ack_before(2_000_000_000_000_000_000)?;
        }

        let mut ts_start_time =
            current_time_ns() / self.timeslice_duration_ns * self.timeslice_duration_ns;
        info!(
            "subtimeslice builder starting at timeslice {}",
            ts_start_time / self.timeslice_duration_ns
        );

        self.tasks.add(BuilderTask::ReportStatus, Instant::now());

        let mut states = vec![ChannelState::TryLater; self.channels.len()];
        let mut ask_again: Vec<usize> = (0..self.channels.len()).collect();

        while !stop.stop_requested() && !self.st_sender.has_stopped() {
            self.handle_completions()?;
            let now = Instant::now();
            while let Some(task) = self.tasks.pop_due(now) {
                match task {
                    BuilderTask::ReportStatus => self.report_status(),
                }
            }

            ask_again.retain(|&i| {
                let state = self.channels[i]
                    .check_availability(ts_start_time, self.timeslice_duration_ns);
                states[i] = state;
                state == ChannelState::TryLater
            });

            let timeout_reached = current_time_ns()
                > ts_start_time
                    + self.timeslice_duration_ns
                    + self.overlap_after_ns
                    + self.timeout_ns;
            if !ask_again.is_empty() && !timeout_reached {
                thread::sleep(Duration::from_nanos(self.timeslice_duration_ns / 10));
                continue;
            }

            self.provide_subtimeslice(&states, ts_start_time)?;
            ts_start_time += self.timeslice_duration_ns;
            ask_again = (0..self.channels.len()).collect();
        }

        info!("subtimeslice builder stopped");
        Ok(())
    }

    /// Drain sender completions; a contiguous prefix of completed ids
    /// releases the matching time range on every channel.
    fn handle_completions(&mut self) -> Result<(), ChannelError> {
        while let Some(id) = self.st_sender.try_receive_completion() {
            match self.completed.get_mut(&id) {
                Some(done) => *done = true,
                None => error!("{id}| received completion for unknown timeslice"),
            }

            let mut prefix_end: Option<StId> = None;
            for (&ts_id, &done) in self.completed.iter() {
                if !done {
                    break;
                }
                prefix_end = Some(ts_id);
            }
            if let Some(last_completed) = prefix_end {
                for channel in &mut self.channels {
                    channel.ack_before((last_completed + 1) * self.timeslice_duration_ns)?;
                }
                self.completed = self.completed.split_off(&(last_completed + 1));
            }
        }
        Ok(())
    }

    /// Assemble and announce one subtimeslice from the collected channel
    /// states.
    fn provide_subtimeslice(
        &mut self,
        states: &[ChannelState],
        start_time: u64,
    ) -> Result<(), ChannelError> {
        let duration = self.timeslice_duration_ns;
        let mut st = SubTimesliceHandle {
            start_time_ns: start_time,
            duration_ns: duration,
            flags: 0,
            components: Vec::new(),
        };

        for (channel, &state) in self.channels.iter().zip(states) {
            match state {
                ChannelState::Ok => {
                    let component = channel.get_descriptor(start_time, duration)?;
                    if component.missing_microslices {
                        st.set_flag(st_flags::OVERFLOW_FLIM);
                    }
                    st.components.push(component);
                }
                ChannelState::Failed | ChannelState::TryLater => {
                    st.set_flag(st_flags::INCOMPLETE);
                }
            }
        }

        self.stats.timeslice_count += 1;
        self.stats.component_count += st.components.len() as u64;
        for c in &st.components {
            self.stats.microslice_count += c.num_microslices();
            self.stats.data_bytes += c.contents_size();
        }
        if st.has_flag(st_flags::INCOMPLETE) {
            self.stats.timeslice_incomplete_count += 1;
        }

        let ts_id = start_time / duration;
        self.st_sender.announce_subtimeslice(ts_id, st);
        self.completed.insert(ts_id, false);
        Ok(())
    }

    /// Periodic telemetry; also the spot where sustained backpressure
    /// turns into retraction of everything still pending.
    fn report_status(&mut self) {
        let mut max_buffer_utilization: f32 = 0.0;
        let now_ns = current_time_ns();

        for channel in &self.channels {
            let mon = channel.get_monitoring();
            max_buffer_utilization = max_buffer_utilization
                .max(mon.desc_buffer_utilization)
                .max(mon.data_buffer_utilization);

            if let Some(monitor) = &self.monitor {
                let mut fields: Vec<(String, crate::monitor::FieldValue)> = vec![
                    (
                        "desc_buffer_utilization".into(),
                        mon.desc_buffer_utilization.into(),
                    ),
                    (
                        "data_buffer_utilization".into(),
                        mon.data_buffer_utilization.into(),
                    ),
                ];
                if let Some(latest) = mon.latest_microslice_time_ns {
                    fields.push(("delay".into(), (now_ns as i64 - latest as i64).into()));
                }
                monitor.queue_metric(
                    "stserver_channel_status",
                    vec![
                        ("host".into(), self.sender_info.address.clone()),
                        ("port".into(), self.sender_info.port.to_string()),
                        ("channel".into(), channel.name().to_owned()),
                    ],
                    fields,
                );
            }
        }

        if let Some(monitor) = &self.monitor {
            let tags = vec![
                ("host".into(), self.sender_info.address.clone()),
                ("port".into(), self.sender_info.port.to_string()),
            ];
            monitor.queue_metric(
                "stserver_status",
                tags.clone(),
                vec![
                    ("timeslice_count".into(), self.stats.timeslice_count.into()),
                    ("component_count".into(), self.stats.component_count.into()),
                    ("microslice_count".into(), self.stats.microslice_count.into()),
                    ("data_bytes".into(), self.stats.data_bytes.into()),
                    (
                        "timeslice_incomplete_count".into(),
                        self.stats.timeslice_incomplete_count.into(),
                    ),
                    ("buffer_utilization".into(), max_buffer_utilization.into()),
                ],
            );
            monitor.queue_metric(
                "tsc_server_status",
                tags,
                vec![
                    ("uptime_s".into(), self.started_at.elapsed().as_secs().into()),
                    ("channels".into(), (self.channels.len() as u64).into()),
                ],
            );
        }

        if max_buffer_utilization > RETRACT_UTILIZATION {
            let pending: Vec<StId> = self
                .completed
                .iter()
                .filter(|(_, &done)| !done)
                .map(|(&id, _)| id)
                .collect();
            warn!(
                "high buffer utilization ({:.1}%), retracting {} pending subtimeslices",
                max_buffer_utilization * 100.0,
                pending.len()
            );
            for id in pending {
                self.st_sender.retract_subtimeslice(id);
            }
        }

        self.tasks
            .add(BuilderTask::ReportStatus, Instant::now() + STATUS_INTERVAL);
    }
}
