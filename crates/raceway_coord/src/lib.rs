//!Client for the race coordinator service that runs multi-track races.
//!Four operations, all request/response over HTTP with JSON bodies:
//!register a track into a circuit, deregister it, wait on the cross-track
//!start barrier, and exchange local results for the merged circuit results.
//!
//!The barrier calls legitimately block until every track in the circuit
//!arrives, so every operation takes a cancellation token and an explicit
//!timeout: a stuck coordinator must never wedge the device.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use raceway_core::{LaneResult, RaceOutcome};

pub mod error;

use error::CoordError;

///Timeout for the plain request/response operations (register, deregister).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

///Remote track metadata as reported by the coordinator. The on-device
///display has room for exactly one remote track, so only the first entry of
///the roster is kept.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteTrack {
    #[serde(rename = "trackName")]
    pub track_name: String,
    #[serde(rename = "numLanes")]
    pub num_lanes: u8,
    #[serde(rename = "carIcons")]
    pub car_icons: Vec<String>,
}

///What we learned from a successful registration. Written once per
///register call, cleared on deregistration.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRecord {
    ///Our address as seen by the coordinator.
    pub ip: String,
    pub remote: RemoteTrack,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    circuit: &'a str,
    #[serde(rename = "trackName")]
    track_name: &'a str,
    #[serde(rename = "numLanes")]
    num_lanes: u8,
    #[serde(rename = "carIcons")]
    car_icons: &'a [String],
}

#[derive(Deserialize)]
struct RegisterReply {
    ip: String,
    #[serde(rename = "remoteRegistrations")]
    remote_registrations: Vec<RemoteTrack>,
}

///Client for one configured coordinator endpoint.
pub struct CoordinatorClient {
    http: reqwest::Client,
    base_url: String,
    barrier_timeout: Duration,
    registration: Option<RegistrationRecord>,
}

impl CoordinatorClient {
    ///`base_url` is e.g. `http://host:1968`. `barrier_timeout` bounds the
    ///start and results barrier calls.
    pub fn new(base_url: &str, barrier_timeout: Duration) -> Result<Self, CoordError> {
        let http = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| CoordError::Failed(format!("building http client: {}", err)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            barrier_timeout,
            registration: None,
        })
    }

    pub fn registration(&self) -> Option<&RegistrationRecord> {
        self.registration.as_ref()
    }

    ///Register the local track into its circuit and record the roster from
    ///the reply.
    pub async fn register(
        &mut self,
        circuit: &str,
        track_name: &str,
        num_lanes: u8,
        car_icons: &[String],
        cancel: &CancellationToken,
    ) -> Result<&RegistrationRecord, CoordError> {
        let url = format!("{}/register", self.base_url);
        let body = RegisterRequest {
            circuit,
            track_name,
            num_lanes,
            car_icons,
        };
        debug!("registering {} with {}", track_name, url);
        let request = self
            .http
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send();
        let response = cancellable(cancel, request).await?;
        let reply: RegisterReply = cancellable(cancel, response.json()).await?;
        let remote = reply
            .remote_registrations
            .into_iter()
            .next()
            .ok_or_else(|| CoordError::Failed("register reply carried no remote tracks".into()))?;
        info!(
            "registered in circuit {}, racing against {}",
            circuit, remote.track_name
        );
        Ok(self.registration.insert(RegistrationRecord {
            ip: reply.ip,
            remote,
        }))
    }

    ///Leave the circuit. Best effort: the node is going away regardless, so
    ///failures are logged and swallowed. Always clears the registration.
    pub async fn deregister(&mut self) {
        self.registration = None;
        let url = format!("{}/deregister", self.base_url);
        let request = self.http.post(&url).timeout(REQUEST_TIMEOUT).send();
        match request.await {
            Ok(response) => debug!("deregistered: {}", response.status()),
            Err(err) => warn!("deregister failed (ignored): {}", err),
        }
    }

    ///The distributed start barrier. Blocks until the coordinator releases
    ///every registered track simultaneously.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), CoordError> {
        let url = format!("{}/start", self.base_url);
        debug!("waiting on start barrier at {}", url);
        let request = self.http.get(&url).timeout(self.barrier_timeout).send();
        let response = cancellable(cancel, request).await?;
        if !response.status().is_success() {
            return Err(CoordError::Failed(format!(
                "start barrier returned {}",
                response.status()
            )));
        }
        info!("start barrier released");
        Ok(())
    }

    ///Exchange local lane results for the merged, circuit-wide outcome.
    ///Also barrier-bound: the coordinator replies once every track has
    ///reported.
    pub async fn results(
        &self,
        local: &[LaneResult],
        cancel: &CancellationToken,
    ) -> Result<RaceOutcome, CoordError> {
        let url = format!("{}/results", self.base_url);
        let request = self
            .http
            .post(&url)
            .timeout(self.barrier_timeout)
            .json(&local)
            .send();
        let response = cancellable(cancel, request).await?;
        let merged: Vec<LaneResult> = cancellable(cancel, response.json()).await?;
        //the coordinator sorts, but re-sorting is cheap and the ordering law
        //is ours to guarantee
        Ok(RaceOutcome::from_unsorted(merged))
    }
}

///Race a coordinator request against the abort token so a user can always
///back out of a blocked call.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, reqwest::Error>>,
) -> Result<T, CoordError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(CoordError::Aborted),
        res = fut => Ok(res?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    ///Minimal canned HTTP responder: answers each accepted connection with
    ///the next body in the list, as JSON.
    async fn canned_server(bodies: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for body in bodies {
                let (mut socket, _) = listener.accept().await.unwrap();
                read_request(&mut socket).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
            }
        });
        format!("http://{}", addr)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if n == 0 || request_complete(&buf) {
                return;
            }
        }
    }

    fn request_complete(buf: &[u8]) -> bool {
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let headers = String::from_utf8_lossy(&buf[..end]).to_lowercase();
        let body_len = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        buf.len() >= end + 4 + body_len
    }

    fn register_reply(remote_name: &str, num_lanes: u8) -> String {
        format!(
            "{{\"ip\":\"10.0.0.7\",\"remoteRegistrations\":[{{\"trackName\":\"{}\",\"numLanes\":{},\"carIcons\":[\"white\",\"blue\"]}}]}}",
            remote_name, num_lanes
        )
    }

    #[tokio::test]
    async fn register_records_first_remote_track() {
        let base = canned_server(vec![register_reply("Track-9", 3)]).await;
        let mut client = CoordinatorClient::new(&base, Duration::from_secs(5)).unwrap();
        let cancel = CancellationToken::new();
        let icons = vec!["white".to_string(), "blue".to_string()];
        let record = client
            .register("DRR", "Track-1", 2, &icons, &cancel)
            .await
            .unwrap();
        assert_eq!(record.ip, "10.0.0.7");
        assert_eq!(record.remote.track_name, "Track-9");
        assert_eq!(record.remote.num_lanes, 3);
    }

    #[tokio::test]
    async fn deregister_clears_registration_and_a_new_register_is_clean() {
        let base = canned_server(vec![
            register_reply("Track-9", 3),
            "{}".to_string(),
            register_reply("Track-5", 1),
        ])
        .await;
        let mut client = CoordinatorClient::new(&base, Duration::from_secs(5)).unwrap();
        let cancel = CancellationToken::new();
        let icons = vec!["white".to_string(), "blue".to_string()];
        client
            .register("DRR", "Track-1", 2, &icons, &cancel)
            .await
            .unwrap();
        client.deregister().await;
        assert!(client.registration().is_none());
        let record = client
            .register("DRR", "Track-1", 4, &icons, &cancel)
            .await
            .unwrap();
        assert_eq!(record.remote.track_name, "Track-5");
        assert_eq!(record.remote.num_lanes, 1);
    }

    #[tokio::test]
    async fn empty_roster_is_a_protocol_failure() {
        let base = canned_server(vec![
            "{\"ip\":\"10.0.0.7\",\"remoteRegistrations\":[]}".to_string()
        ])
        .await;
        let mut client = CoordinatorClient::new(&base, Duration::from_secs(5)).unwrap();
        let cancel = CancellationToken::new();
        let err = client
            .register("DRR", "Track-1", 2, &[], &cancel)
            .await
            .unwrap_err();
        assert!(!err.is_aborted());
    }

    #[tokio::test]
    async fn start_barrier_is_abortable() {
        //server accepts the connection but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(socket);
        });
        let client =
            CoordinatorClient::new(&format!("http://{}", addr), Duration::from_secs(60)).unwrap();
        let cancel = CancellationToken::new();
        let abort = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            abort.cancel();
        });
        let err = client.start(&cancel).await.unwrap_err();
        assert!(err.is_aborted());
    }

    #[tokio::test]
    async fn results_exchange_returns_merged_outcome() {
        let merged = "[{\"trackName\":\"Track-2\",\"laneNumber\":1,\"laneTime\":1.1},\
                      {\"trackName\":\"Track-1\",\"laneNumber\":1,\"laneTime\":1.9}]";
        let base = canned_server(vec![merged.to_string()]).await;
        let client = CoordinatorClient::new(&base, Duration::from_secs(5)).unwrap();
        let cancel = CancellationToken::new();
        let local = vec![LaneResult {
            track_name: "Track-1".to_string(),
            lane_number: 1,
            lane_time: 1.9,
        }];
        let outcome = client.results(&local, &cancel).await.unwrap();
        assert_eq!(outcome.results().len(), 2);
        assert_eq!(outcome.results()[0].track_name, "Track-2");
    }
}
