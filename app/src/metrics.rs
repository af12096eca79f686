use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, Encoder, IntCounter, IntGauge, IntGaugeVec, Registry,
    TextEncoder,
};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;

// Create a new registry named `chaosd`
lazy_static! {
    pub static ref CHAOSD_REGISTRY: Registry =
        Registry::new_custom(Some("chaosd".to_string()), None).unwrap();
}

// Register metrics with the `chaosd` registry
lazy_static! {
    pub static ref REQUESTS_ROUTED: IntGauge = register_int_gauge_with_registry!(
        "balancer_requests_routed",
        "Total requests routed through the load balancer since startup",
        CHAOSD_REGISTRY
    )
    .unwrap();
    pub static ref EXPERIMENTS_STARTED: IntCounter = register_int_counter_with_registry!(
        "experiments_started_total",
        "Number of chaos experiments admitted and started",
        CHAOSD_REGISTRY
    )
    .unwrap();
    pub static ref EXPERIMENTS_COMPLETED: IntCounter = register_int_counter_with_registry!(
        "experiments_completed_total",
        "Number of chaos experiments that ran to completion",
        CHAOSD_REGISTRY
    )
    .unwrap();
    pub static ref EXPERIMENTS_FAILED: IntCounter = register_int_counter_with_registry!(
        "experiments_failed_total",
        "Number of chaos experiments that ended in an error",
        CHAOSD_REGISTRY
    )
    .unwrap();
    pub static ref EXPERIMENTS_CANCELLED: IntCounter = register_int_counter_with_registry!(
        "experiments_cancelled_total",
        "Number of chaos experiments stopped before their deadline",
        CHAOSD_REGISTRY
    )
    .unwrap();
    pub static ref INSTANCES_TERMINATED: IntCounter = register_int_counter_with_registry!(
        "instances_terminated_total",
        "Instances terminated by the chaos monkey",
        CHAOSD_REGISTRY
    )
    .unwrap();
    pub static ref OPEN_ALERTS: IntGauge = register_int_gauge_with_registry!(
        "monitoring_open_alerts",
        "Currently unresolved alerts across the fleet",
        CHAOSD_REGISTRY
    )
    .unwrap();
    pub static ref HEALTHY_INSTANCES: IntGaugeVec = register_int_gauge_vec_with_registry!(
        "service_healthy_instances",
        "Healthy instance count, labeled by service",
        &["service"],
        CHAOSD_REGISTRY
    )
    .unwrap();
    pub static ref PROCESS_START_TIME: IntGauge = register_int_gauge_with_registry!(
        "process_start_time_seconds",
        "Unix timestamp of process start",
        CHAOSD_REGISTRY
    )
    .unwrap();
}

async fn handle_request(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            // Gather from both the `chaosd` registry and the default registry
            let mut metric_families = CHAOSD_REGISTRY.gather();
            metric_families.extend(prometheus::gather());

            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            encoder.encode(&metric_families, &mut buffer).unwrap();

            let response = Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, encoder.format_type())
                .body(Body::from(buffer))
                .unwrap();

            Ok(response)
        }
        (&Method::GET, "/health") => {
            let health_status = json!({
                "status": "healthy",
                "timestamp": std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
                "version": env!("CARGO_PKG_VERSION"),
                "metrics_count": CHAOSD_REGISTRY.gather().len()
            });

            let response = Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Body::from(health_status.to_string()))
                .unwrap();

            Ok(response)
        }
        (&Method::GET, "/ready") => {
            let response = Response::builder()
                .status(StatusCode::OK)
                .body(Body::from("ready"))
                .unwrap();
            Ok(response)
        }
        _ => {
            let mut not_found = Response::new(Body::from("Not Found"));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Ok(not_found)
        }
    }
}

pub async fn start_server(port_number: Option<u16>) {
    const DEFAULT_PORT: u16 = 9001;

    let port = port_number.unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle_request)) });

    let server = Server::bind(&addr).serve(make_svc);

    PROCESS_START_TIME.set(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64,
    );

    tokio::spawn(async move {
        tracing::info!("metrics server listening on {} (/metrics /health /ready)", addr);

        if let Err(e) = server.await {
            tracing::error!("metrics server error: {}", e);
        }
    });
}
