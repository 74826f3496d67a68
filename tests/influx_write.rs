use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;

use vsphere_influxdb::config::InfluxDbConfig;
use vsphere_influxdb::point::Point;
use vsphere_influxdb::sink::line_protocol::Precision;
use vsphere_influxdb::sink::{InfluxWriter, Sink};

#[derive(Debug, Clone)]
struct Captured {
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: Vec<u8>,
}

#[derive(Clone)]
struct FakeInflux {
    requests: Arc<Mutex<Vec<Captured>>>,
    status: StatusCode,
}

async fn write_handler(
    State(state): State<FakeInflux>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    if let Ok(mut requests) = state.requests.lock() {
        requests.push(Captured {
            query,
            headers,
            body: body.to_vec(),
        });
    }

    if state.status.is_success() {
        (state.status, "")
    } else {
        (state.status, "{\"error\":\"database not found: \\\"vsphere\\\"\"}")
    }
}

/// Serves a fake `/write` endpoint and returns its base URL.
async fn serve(status: StatusCode) -> (String, Arc<Mutex<Vec<Captured>>>) {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let state = FakeInflux {
        requests: Arc::clone(&requests),
        status,
    };

    let app = Router::new()
        .route("/write", post(write_handler))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (format!("http://{addr}"), requests)
}

fn points() -> Vec<Point> {
    vec![
        Point {
            measurement: "virtualmachine".to_string(),
            tags: BTreeMap::from([
                ("host".to_string(), "vc01".to_string()),
                ("name".to_string(), "web01".to_string()),
            ]),
            fields: BTreeMap::from([("cpu_usage_average".to_string(), 50)]),
            timestamp: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        },
        Point {
            measurement: "disk".to_string(),
            tags: BTreeMap::from([
                ("host".to_string(), "vc01".to_string()),
                ("instance".to_string(), "scsi0".to_string()),
                ("name".to_string(), "web01".to_string()),
            ]),
            fields: BTreeMap::from([("disk_usage_average".to_string(), 25)]),
            timestamp: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        },
    ]
}

fn writer(url: String, compression: &str, username: &str) -> InfluxWriter {
    InfluxWriter::new(InfluxDbConfig {
        hostname: url,
        username: username.to_string(),
        password: "secret".to_string(),
        database: "vsphere".to_string(),
        compression: compression.to_string(),
        ..Default::default()
    })
    .expect("writer")
}

#[tokio::test]
async fn writes_line_protocol_with_basic_auth() {
    let (url, requests) = serve(StatusCode::NO_CONTENT).await;

    writer(url, "none", "collector")
        .write("vsphere", &points())
        .await
        .expect("write should succeed");

    let requests = requests.lock().expect("requests").clone();
    assert_eq!(requests.len(), 1);

    let req = &requests[0];
    assert_eq!(req.query["db"], "vsphere");
    assert_eq!(req.query["precision"], Precision::Seconds.as_str());
    assert!(req.headers.get("authorization").is_some());
    assert!(req.headers.get("content-encoding").is_none());

    let body = String::from_utf8(req.body.clone()).expect("utf8 body");
    assert_eq!(
        body,
        "virtualmachine,host=vc01,name=web01 cpu_usage_average=50i 1700000000\n\
         disk,host=vc01,instance=scsi0,name=web01 disk_usage_average=25i 1700000000\n"
    );
}

#[tokio::test]
async fn gzip_body_without_credentials() {
    let (url, requests) = serve(StatusCode::NO_CONTENT).await;

    writer(url, "gzip", "")
        .write("vsphere", &points())
        .await
        .expect("write should succeed");

    let requests = requests.lock().expect("requests").clone();
    let req = &requests[0];
    assert_eq!(
        req.headers
            .get("content-encoding")
            .and_then(|v| v.to_str().ok()),
        Some("gzip")
    );
    assert!(req.headers.get("authorization").is_none());

    let mut decoder = flate2::read::GzDecoder::new(req.body.as_slice());
    let mut body = String::new();
    decoder.read_to_string(&mut body).expect("gunzip");
    assert_eq!(body.lines().count(), 2);
    assert!(body.starts_with("virtualmachine,host=vc01"));
}

#[tokio::test]
async fn non_success_status_is_an_error() {
    let (url, _) = serve(StatusCode::NOT_FOUND).await;

    let err = writer(url, "none", "")
        .write("vsphere", &points())
        .await
        .expect_err("write should fail");

    let msg = err.to_string();
    assert!(msg.contains("404"), "unexpected error: {msg}");
    assert!(msg.contains("database not found"), "unexpected error: {msg}");
}

#[tokio::test]
async fn empty_batch_sends_nothing() {
    let (url, requests) = serve(StatusCode::NO_CONTENT).await;

    writer(url, "none", "")
        .write("vsphere", &[])
        .await
        .expect("empty write");

    assert!(requests.lock().expect("requests").is_empty());
}
