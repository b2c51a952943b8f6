//! Pool lifecycle: keep-alive reuse, the concurrency cap, and the reapers.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use fleethttp::{HostClient, HostConfig, Request, Response};

fn host_client(addr: String, tweak: impl FnOnce(&mut HostConfig)) -> HostClient {
    let mut config = HostConfig {
        addr,
        ..HostConfig::default()
    };
    tweak(&mut config);
    HostClient::new(config)
}

async fn get(hc: &HostClient, url: &str) -> fleethttp::Result<Response> {
    let mut req = Request::new();
    req.set_request_uri(url).unwrap();
    let mut resp = Response::new();
    hc.send(&mut req, &mut resp).await?;
    Ok(resp)
}

#[tokio::test]
async fn sequential_gets_reuse_one_connection() {
    let server = support::start(|mut stream, _| async move {
        while support::read_request(&mut stream).await.is_some() {
            let _ = stream
                .write_all(support::ok_response("hi").as_bytes())
                .await;
        }
    })
    .await;

    let hc = host_client(server.addr.to_string(), |c| c.max_conns = 4);
    for _ in 0..10 {
        let resp = get(&hc, &server.url("/")).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body(), b"hi");
    }

    assert_eq!(server.accepted(), 1);
    assert_eq!(hc.conn_count(), 1);
    assert_eq!(hc.idle_conn_count(), 1);
}

#[tokio::test]
async fn saturated_pool_rejects_without_blocking() {
    let server = support::start(|mut stream, _| async move {
        while support::read_request(&mut stream).await.is_some() {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = stream
                .write_all(support::ok_response("slow").as_bytes())
                .await;
        }
    })
    .await;

    let hc = host_client(server.addr.to_string(), |c| c.max_conns = 2);
    let url = server.url("/");

    let mut in_flight = Vec::new();
    for _ in 0..2 {
        let hc = hc.clone();
        let url = url.clone();
        in_flight.push(tokio::spawn(async move { get(&hc, &url).await }));
    }
    server.wait_accepted(2).await;

    let err = get(&hc, &url).await.unwrap_err();
    assert!(err.is_no_free_conns());

    for task in in_flight {
        let resp = task.await.unwrap().unwrap();
        assert_eq!(resp.status(), 200);
    }
}

#[tokio::test]
async fn saturated_pool_waits_under_a_deadline() {
    let server = support::start(|mut stream, _| async move {
        while support::read_request(&mut stream).await.is_some() {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = stream
                .write_all(support::ok_response("slow").as_bytes())
                .await;
        }
    })
    .await;

    let hc = host_client(server.addr.to_string(), |c| c.max_conns = 2);
    let url = server.url("/");

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let hc = hc.clone();
        let url = url.clone();
        tasks.push(tokio::spawn(async move {
            let mut req = Request::new();
            req.set_request_uri(&url).unwrap();
            let mut resp = Response::new();
            hc.send_timeout(&mut req, &mut resp, Duration::from_secs(2))
                .await?;
            Ok::<_, fleethttp::Error>(resp.status())
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 200);
    }
    assert!(hc.conn_count() <= 2);
}

#[tokio::test]
async fn max_conns_one_second_request_times_out() {
    let server = support::start(|mut stream, _| async move {
        while support::read_request(&mut stream).await.is_some() {
            tokio::time::sleep(Duration::from_millis(700)).await;
            let _ = stream
                .write_all(support::ok_response("slow").as_bytes())
                .await;
        }
    })
    .await;

    let hc = host_client(server.addr.to_string(), |c| c.max_conns = 1);
    let url = server.url("/");

    let first = {
        let hc = hc.clone();
        let url = url.clone();
        tokio::spawn(async move { get(&hc, &url).await })
    };
    server.wait_accepted(1).await;

    let err = get(&hc, &url).await.unwrap_err();
    assert!(err.is_no_free_conns());

    let mut req = Request::new();
    req.set_request_uri(&url).unwrap();
    let mut resp = Response::new();
    let err = hc
        .send_timeout(&mut req, &mut resp, Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    assert_eq!(first.await.unwrap().unwrap().status(), 200);
}

#[tokio::test]
async fn idle_reaper_drains_the_pool() {
    let server = support::start(|mut stream, _| async move {
        while support::read_request(&mut stream).await.is_some() {
            let _ = stream
                .write_all(support::ok_response("hi").as_bytes())
                .await;
        }
    })
    .await;

    let hc = host_client(server.addr.to_string(), |c| {
        c.max_idle_conn_duration = Duration::from_millis(200);
    });
    get(&hc, &server.url("/")).await.unwrap();
    assert_eq!(hc.conn_count(), 1);

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(hc.conn_count(), 0);
    assert_eq!(hc.idle_conn_count(), 0);
}

#[tokio::test]
async fn aged_connection_is_reset() {
    let heads: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = heads.clone();
    let server = support::start(move |mut stream, _| {
        let seen = seen.clone();
        async move {
            while let Some(req) = support::read_request(&mut stream).await {
                seen.lock().unwrap().push(req.head);
                let _ = stream
                    .write_all(support::ok_response("hi").as_bytes())
                    .await;
            }
        }
    })
    .await;

    let hc = host_client(server.addr.to_string(), |c| {
        c.max_conn_duration = Duration::from_millis(200);
    });
    let url = server.url("/");

    get(&hc, &url).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Second exchange rides the aged connection, marked Connection: close,
    // and the connection is retired afterwards.
    get(&hc, &url).await.unwrap();
    assert_eq!(server.accepted(), 1);
    assert_eq!(hc.conn_count(), 0);

    get(&hc, &url).await.unwrap();
    assert_eq!(server.accepted(), 2);

    let heads = heads.lock().unwrap();
    assert!(!heads[0].to_ascii_lowercase().contains("connection: close"));
    assert!(heads[1].to_ascii_lowercase().contains("connection: close"));
    assert!(!heads[2].to_ascii_lowercase().contains("connection: close"));
}

#[tokio::test]
async fn close_response_header_retires_the_connection() {
    let server = support::start(|mut stream, _| async move {
        if support::read_request(&mut stream).await.is_some() {
            let _ = stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                )
                .await;
        }
    })
    .await;

    let hc = host_client(server.addr.to_string(), |_| {});
    let resp = get(&hc, &server.url("/")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.connection_close());
    assert_eq!(hc.conn_count(), 0);

    get(&hc, &server.url("/")).await.unwrap();
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn http10_response_is_not_pooled() {
    let server = support::start(|mut stream, _| async move {
        if support::read_request(&mut stream).await.is_some() {
            let _ = stream
                .write_all(b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await;
        }
    })
    .await;

    let hc = host_client(server.addr.to_string(), |_| {});
    let resp = get(&hc, &server.url("/")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(hc.conn_count(), 0);
}

#[tokio::test]
async fn request_close_header_retires_the_connection() {
    let server = support::start(|mut stream, _| async move {
        while support::read_request(&mut stream).await.is_some() {
            let _ = stream
                .write_all(support::ok_response("hi").as_bytes())
                .await;
        }
    })
    .await;

    let hc = host_client(server.addr.to_string(), |_| {});
    let mut req = Request::new();
    req.set_request_uri(&server.url("/")).unwrap();
    req.set_connection_close();
    let mut resp = Response::new();
    hc.send(&mut req, &mut resp).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(hc.conn_count(), 0);
}
