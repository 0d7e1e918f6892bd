//! Job records and result routing
//!
//! A job is opened when a request is handed to a worker and closed by the
//! worker's result. Results go back the way the request came:
//!
//! - plan jobs to the plan dispatcher (`plan_end`)
//! - loopback jobs to the proxy dispatcher (`proxy_end`)
//! - client jobs straight to the requester

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use super::{SocketRole, StationCore};
use crate::frame::{Envelope, FrameType, Origin, Tag, TracePoint};
use crate::registry::Counter;
use crate::types::{format_global_id, parse_global_id, GlobalId, Status};

/// Whether the router minted the id or found one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    New,
    Resumed,
}

/// Who is waiting for the result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSource {
    Client,
    Loopback,
    Plan,
}

impl JobSource {
    pub fn of(env: &Envelope) -> Self {
        if env.description().contains(FrameType::Plan) {
            JobSource::Plan
        } else if env.origin() == Origin::Loopback {
            JobSource::Loopback
        } else {
            JobSource::Client
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub global_id: GlobalId,
    pub requester: Bytes,
    /// Socket the request arrived on
    pub role: SocketRole,
    pub source: JobSource,
    pub worker: Option<Bytes>,
    pub started: Instant,
    pub request: Envelope,
}

impl Job {
    pub fn new(global_id: GlobalId, role: SocketRole, request: Envelope) -> Self {
        Self {
            global_id,
            requester: request.address().clone(),
            role,
            source: JobSource::of(&request),
            worker: None,
            started: Instant::now(),
            request,
        }
    }

    pub fn with_worker(mut self, worker: Bytes) -> Self {
        self.worker = Some(worker);
        self
    }
}

/// Open jobs of one station
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: HashMap<GlobalId, Job>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: Job) {
        self.jobs.insert(job.global_id, job);
    }

    pub fn get(&self, global_id: GlobalId) -> Option<&Job> {
        self.jobs.get(&global_id)
    }

    pub fn finish(&mut self, global_id: GlobalId) -> Option<Job> {
        self.jobs.remove(&global_id)
    }

    /// Remove jobs running longer than `timeout`
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<Job> {
        let stale: Vec<GlobalId> = self
            .jobs
            .values()
            .filter(|j| now.saturating_duration_since(j.started) > timeout)
            .map(|j| j.global_id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.jobs.remove(&id))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<Job> {
        self.jobs.drain().map(|(_, j)| j).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Route a worker result to whoever waits for it
pub async fn complete(core: &mut StationCore, env: Envelope) {
    let Some(global_id) = env.frame(FrameType::GlobalId).and_then(|f| parse_global_id(f)) else {
        debug!("Station {}: result without global id dropped", core.name);
        core.bump(Counter::WorkerErr);
        return;
    };
    let Some(job) = core.jobs.finish(global_id) else {
        debug!(
            "Station {}: result for unknown job {} dropped",
            core.name,
            format_global_id(global_id)
        );
        return;
    };

    let mut result = env;
    result.strip_service_key();
    result.description_mut().set_tag(Tag::ResultEnd);

    match job.source {
        JobSource::Plan => plan_end(core, result).await,
        JobSource::Loopback => {
            if result.frame(FrameType::Requester).is_none() {
                result.append_frame(FrameType::Requester, job.requester.clone());
            }
            proxy_end(core, result).await
        }
        JobSource::Client => {
            result.remove_frame(FrameType::Requester);
            result.set_address(job.requester.clone());
            let delivered = core.reply(job.role, result.clone()).await;
            let status = if delivered {
                Status::Ok
            } else {
                Status::SendError
            };
            core.trace(&result, TracePoint::End, Some(status.as_str()))
                .await;
        }
    }
}

/// Hand a finished plan job back to the plan dispatcher
pub async fn plan_end(core: &mut StationCore, mut env: Envelope) {
    env.append_frame(FrameType::StationId, Bytes::from(core.name.clone()));
    forward_end(core, SocketRole::PlanDispatch, env).await;
}

/// Hand a finished loopback job back to the proxy dispatcher
pub async fn proxy_end(core: &mut StationCore, env: Envelope) {
    forward_end(core, SocketRole::ProxyDispatch, env).await;
}

async fn forward_end(core: &mut StationCore, role: SocketRole, env: Envelope) {
    let traced = env.clone();
    match core.send(role, env).await {
        Ok(()) => {
            core.bump(Counter::RequestOut);
            core.trace(&traced, TracePoint::End, Some(Status::Ok.as_str()))
                .await;
        }
        Err(e) => {
            warn!(
                "Station {}: {} of job failed: {}",
                core.name,
                role.as_str(),
                e
            );
            core.bump(Counter::RequestErr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Command, Description};

    fn request(origin: Origin, with_plan: bool) -> Envelope {
        let mut env = Envelope::new(
            origin,
            Bytes::from_static(b"client"),
            Description::new(Command::None),
        )
        .with_frame(FrameType::Argument, Bytes::from_static(b"x"));
        if with_plan {
            env.append_frame(FrameType::Plan, Bytes::from_static(b"p1"));
        }
        env
    }

    #[test]
    fn test_job_source() {
        assert_eq!(JobSource::of(&request(Origin::External, false)), JobSource::Client);
        assert_eq!(JobSource::of(&request(Origin::Loopback, false)), JobSource::Loopback);
        assert_eq!(JobSource::of(&request(Origin::Loopback, true)), JobSource::Plan);
    }

    #[test]
    fn test_job_table_finish_and_expire() {
        let mut table = JobTable::new();
        table.insert(Job::new(1, SocketRole::RequestExternal, request(Origin::External, false)));
        table.insert(
            Job::new(2, SocketRole::RequestExternal, request(Origin::External, false))
                .with_worker(Bytes::from_static(b"w1")),
        );
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(2).and_then(|j| j.worker.clone()), Some(Bytes::from_static(b"w1")));

        assert!(table.finish(1).is_some());
        assert!(table.finish(1).is_none());

        let later = Instant::now() + Duration::from_secs(60);
        let expired = table.expire(later, Duration::from_secs(30));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].global_id, 2);
        assert!(table.is_empty());
    }
}
