//! Prometheus metrics HTTP endpoint
//!
//! Renders the lifetime horizon in Prometheus text exposition format and
//! serves it over HTTP/1 with hyper. Rendering only takes non-destructive
//! snapshots, so scraping never disturbs the reporter's window.

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::metrics::{throughput, MetricsAggregator};
use crate::utils::{resident_memory_bytes, trim_float};

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

fn write_header(output: &mut String, name: &str, help: &str, typ: &str) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {typ}");
}

/// Format the aggregator's lifetime state in Prometheus text format.
pub fn render_prometheus(metrics: &MetricsAggregator) -> String {
    let total = metrics.snapshot_total();
    let elapsed = metrics.elapsed().as_secs_f64();
    let mut output = String::with_capacity(2048);

    write_header(
        &mut output,
        "loadbench_success_total",
        "Total successful units of work.",
        "counter",
    );
    let _ = writeln!(output, "loadbench_success_total {}", total.successes);

    write_header(
        &mut output,
        "loadbench_failure_total",
        "Total failed units of work.",
        "counter",
    );
    let _ = writeln!(output, "loadbench_failure_total {}", total.failures);

    write_header(
        &mut output,
        "loadbench_throughput",
        "Average successful units of work per second since start.",
        "gauge",
    );
    let _ = writeln!(
        output,
        "loadbench_throughput {:.6}",
        throughput(total.successes, elapsed)
    );

    write_header(
        &mut output,
        "loadbench_latency_ms",
        "Latency histogram in milliseconds.",
        "histogram",
    );
    for (bound, cumulative) in total.histogram.cumulative_buckets() {
        let le = bound.map_or_else(|| "+Inf".to_string(), trim_float);
        let _ = writeln!(output, "loadbench_latency_ms_bucket{{le=\"{le}\"}} {cumulative}");
    }
    let _ = writeln!(output, "loadbench_latency_ms_sum {:.3}", total.histogram.sum_ms());
    let _ = writeln!(output, "loadbench_latency_ms_count {}", total.histogram.count());

    if let Some(rss) = resident_memory_bytes() {
        write_header(
            &mut output,
            "loadbench_resident_memory_bytes",
            "Resident set size of the load generator.",
            "gauge",
        );
        let _ = writeln!(output, "loadbench_resident_memory_bytes {rss}");
    }

    output
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<MetricsAggregator>,
    path: Arc<str>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, p) if p == &*path => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", CONTENT_TYPE)
            .body(Full::new(Bytes::from(render_prometheus(&metrics)))),
        (&Method::GET, "/health") => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok"))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found"))),
    };
    Ok(response.expect("static response should not fail"))
}

/// HTTP server exposing [`render_prometheus`].
pub struct PrometheusServer {
    listener: TcpListener,
    path: Arc<str>,
    metrics: Arc<MetricsAggregator>,
}

impl PrometheusServer {
    /// Bind the listener. Use port 0 to pick a free port.
    pub async fn bind(
        addr: SocketAddr,
        path: &str,
        metrics: Arc<MetricsAggregator>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind Prometheus listener on {}", addr))?;
        Ok(Self {
            listener,
            path: Arc::from(path),
            metrics,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` turns `true` or its sender is dropped.
    ///
    /// Open connections are shut down gracefully at the same time: an idle
    /// keep-alive connection is closed, one mid-request finishes it first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Prometheus metrics available at http://{}{}",
            self.local_addr()?,
            self.path
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!("Prometheus scrape connection from {}", peer);
                            let io = TokioIo::new(stream);
                            let metrics = Arc::clone(&self.metrics);
                            let path = Arc::clone(&self.path);
                            let mut conn_shutdown = shutdown.clone();

                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    let metrics = Arc::clone(&metrics);
                                    let path = Arc::clone(&path);
                                    async move { handle_request(req, metrics, path).await }
                                });

                                // Keep-alive connections end with the server.
                                let conn = http1::Builder::new().serve_connection(io, service);
                                tokio::pin!(conn);
                                let result = tokio::select! {
                                    result = conn.as_mut() => result,
                                    _ = conn_shutdown.changed() => {
                                        conn.as_mut().graceful_shutdown();
                                        conn.as_mut().await
                                    }
                                };
                                if let Err(e) = result {
                                    error!("Prometheus HTTP connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Prometheus accept error: {}", e);
                        }
                    }
                }
            }
        }

        debug!("Prometheus metrics server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Outcome;
    use std::time::Duration;

    #[test]
    fn test_render_prometheus() {
        let metrics = MetricsAggregator::new(&[0.25, 1.0, 5.0]).unwrap();
        metrics.record(Outcome::Success(Duration::from_micros(200)));
        metrics.record(Outcome::Success(Duration::from_millis(1)));
        metrics.record(Outcome::Success(Duration::from_millis(9)));
        metrics.record(Outcome::Failure);

        let output = render_prometheus(&metrics);

        assert!(output.contains("# TYPE loadbench_success_total counter"));
        assert!(output.contains("loadbench_success_total 3\n"));
        assert!(output.contains("loadbench_failure_total 1\n"));
        assert!(output.contains("# TYPE loadbench_throughput gauge"));
        assert!(output.contains("# TYPE loadbench_latency_ms histogram"));
        assert!(output.contains("loadbench_latency_ms_bucket{le=\"0.25\"} 1\n"));
        assert!(output.contains("loadbench_latency_ms_bucket{le=\"1\"} 2\n"));
        assert!(output.contains("loadbench_latency_ms_bucket{le=\"5\"} 2\n"));
        assert!(output.contains("loadbench_latency_ms_bucket{le=\"+Inf\"} 3\n"));
        assert!(output.contains("loadbench_latency_ms_sum 10.200\n"));
        assert!(output.contains("loadbench_latency_ms_count 3\n"));
    }

    #[test]
    fn test_render_leaves_window_untouched() {
        let metrics = MetricsAggregator::new(&[1.0]).unwrap();
        metrics.record(Outcome::Success(Duration::from_micros(500)));
        let _ = render_prometheus(&metrics);
        assert_eq!(metrics.snapshot_window().successes(), 1);
    }

    #[tokio::test]
    async fn test_server_stops_on_shutdown() {
        let metrics = Arc::new(MetricsAggregator::new(&[1.0]).unwrap());
        let server = PrometheusServer::bind("127.0.0.1:0".parse().unwrap(), "/metrics", metrics)
            .await
            .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_keep_alive_connection() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let metrics = Arc::new(MetricsAggregator::new(&[1.0]).unwrap());
        let server = PrometheusServer::bind("127.0.0.1:0".parse().unwrap(), "/metrics", metrics)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(rx));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        let mut buf = [0u8; 512];
        while !response.ends_with(b"ok") {
            let n = stream.read(&mut buf).await.unwrap();
            assert_ne!(n, 0, "connection closed before the response");
            response.extend_from_slice(&buf[..n]);
        }

        tx.send(true).unwrap();
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("idle connection outlived shutdown")
            .unwrap();
        assert_eq!(n, 0);
        handle.await.unwrap().unwrap();
    }
}
