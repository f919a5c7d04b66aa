use lazy_static::lazy_static;
use prometheus::{register_counter, register_counter_vec};

lazy_static! {
    static ref FUNCTION_CALLS: prometheus::CounterVec = register_counter_vec!(
        "gateway_function_calls_total",
        "Total number of function calls completed, by outcome.",
        &["outcome"]
    )
    .unwrap();
    static ref FUNCTION_RETRIES: prometheus::CounterVec = register_counter_vec!(
        "gateway_function_retries_total",
        "Total number of function call attempts retried on a fresh connection, by gRPC status code.",
        &["code"]
    )
    .unwrap();
    static ref PROXY_REQUESTS: prometheus::CounterVec = register_counter_vec!(
        "gateway_proxy_requests_total",
        "Total number of service proxy requests, by outcome.",
        &["outcome"]
    )
    .unwrap();
    static ref CONNECTIONS_DIALED: prometheus::Counter = register_counter!(
        "gateway_connections_dialed_total",
        "Total number of outbound gRPC connections created."
    )
    .unwrap();
}

// Label values must come from closed sets: service names and addresses are
// chosen by whoever sends the request.

pub(crate) fn function_call(outcome: &'static str) {
    FUNCTION_CALLS.with_label_values(&[outcome]).inc();
}

pub(crate) fn function_retry(code: tonic::Code) {
    let code = format!("{:?}", code);
    FUNCTION_RETRIES.with_label_values(&[code.as_str()]).inc();
}

pub(crate) fn proxy_request(outcome: &'static str) {
    PROXY_REQUESTS.with_label_values(&[outcome]).inc();
}

pub(crate) fn connection_dialed() {
    CONNECTIONS_DIALED.inc();
}

#[cfg(test)]
pub(crate) fn label_values(family: &str, label: &str) -> Vec<String> {
    prometheus::gather()
        .iter()
        .filter(|f| f.get_name() == family)
        .flat_map(|f| f.get_metric().iter())
        .flat_map(|m| m.get_label().iter())
        .filter(|l| l.get_name() == label)
        .map(|l| l.get_value().to_owned())
        .collect()
}
