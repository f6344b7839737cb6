//! Parsing for orchestrator resource-quantity strings.
//!
//! The API hands us CPU and memory as free-form strings (`500m`, `1.5`,
//! `512Mi`, `129M`, `128974848`). Planning must never stall on a malformed
//! value coming from a third-party pod spec, so these parsers are total:
//! anything unrecognized coerces to 0.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

// Binary suffixes must be matched before their decimal prefixes ("Gi" before "G").
const MEMORY_SUFFIXES: &[(&str, i64)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("K", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
];

/// Parses a CPU quantity into integer millicores.
///
/// `<n>m` is taken as millicores directly; a bare decimal is a number of
/// cores, multiplied by 1000 and truncated.
pub fn parse_cpu_millis(cpu: &str) -> i64 {
    let s = cpu.trim();
    if s.is_empty() {
        return 0;
    }
    if let Some(millis) = s.strip_suffix('m') {
        return millis.parse::<i64>().unwrap_or(0).max(0);
    }
    s.parse::<f64>()
        .map(|cores| (cores * 1000.0) as i64)
        .unwrap_or(0)
        .max(0)
}

/// Parses a memory quantity into bytes.
///
/// Binary suffixes (`Ki`, `Mi`, `Gi`, `Ti`) are powers of 1024, decimal
/// suffixes (`K`, `M`, `G`, `T`) powers of 1000, and a bare number is raw
/// bytes. Unknown suffixes coerce to 0.
pub fn parse_mem_bytes(mem: &str) -> i64 {
    let s = mem.trim();
    if s.is_empty() {
        return 0;
    }
    for (suffix, multiplier) in MEMORY_SUFFIXES {
        if let Some(value) = s.strip_suffix(suffix) {
            return value
                .parse::<f64>()
                .map(|v| (v * *multiplier as f64) as i64)
                .unwrap_or(0)
                .max(0);
        }
    }
    s.parse::<f64>().map(|v| v as i64).unwrap_or(0).max(0)
}

fn quantity_or_zero(quantity: Option<&Quantity>, parse: fn(&str) -> i64) -> i64 {
    quantity.map(|q| parse(&q.0)).unwrap_or(0)
}

/// Sums the CPU (millicores) and memory (bytes) requests of all containers in
/// a pod. Containers without requests contribute zero.
pub fn pod_requests(pod: &Pod) -> (i64, i64) {
    let mut cpu = 0;
    let mut mem = 0;
    let containers = pod.spec.as_ref().map(|spec| &spec.containers);
    for container in containers.into_iter().flatten() {
        let requests = container
            .resources
            .as_ref()
            .and_then(|resources| resources.requests.as_ref());
        if let Some(requests) = requests {
            cpu += quantity_or_zero(requests.get("cpu"), parse_cpu_millis);
            mem += quantity_or_zero(requests.get("memory"), parse_mem_bytes);
        }
    }
    (cpu, mem)
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
    use maplit::btreemap;

    #[test]
    fn cpu_millicores_form() {
        assert_eq!(parse_cpu_millis("500m"), 500);
        assert_eq!(parse_cpu_millis("0m"), 0);
        assert_eq!(parse_cpu_millis("1500m"), 1500);
    }

    #[test]
    fn cpu_decimal_cores_form() {
        assert_eq!(parse_cpu_millis("1"), 1000);
        assert_eq!(parse_cpu_millis("1.5"), 1500);
        assert_eq!(parse_cpu_millis("0.1"), 100);
        // Truncation, not rounding.
        assert_eq!(parse_cpu_millis("0.0015"), 1);
    }

    #[test]
    fn cpu_malformed_coerces_to_zero() {
        assert_eq!(parse_cpu_millis(""), 0);
        assert_eq!(parse_cpu_millis("abc"), 0);
        assert_eq!(parse_cpu_millis("1m5"), 0);
        assert_eq!(parse_cpu_millis("-2"), 0);
    }

    #[test]
    fn memory_binary_suffixes() {
        assert_eq!(parse_mem_bytes("1Ki"), 1024);
        assert_eq!(parse_mem_bytes("512Mi"), 512 * 1024 * 1024);
        assert_eq!(parse_mem_bytes("2Gi"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_mem_bytes("1Ti"), 1 << 40);
        assert_eq!(parse_mem_bytes("1.5Gi"), (1.5 * (1u64 << 30) as f64) as i64);
    }

    #[test]
    fn memory_decimal_suffixes() {
        assert_eq!(parse_mem_bytes("1K"), 1000);
        assert_eq!(parse_mem_bytes("129M"), 129_000_000);
        assert_eq!(parse_mem_bytes("3G"), 3_000_000_000);
        assert_eq!(parse_mem_bytes("1T"), 1_000_000_000_000);
    }

    #[test]
    fn memory_raw_bytes_and_malformed() {
        assert_eq!(parse_mem_bytes("128974848"), 128974848);
        assert_eq!(parse_mem_bytes(""), 0);
        assert_eq!(parse_mem_bytes("5Xi"), 0);
        assert_eq!(parse_mem_bytes("lots"), 0);
        assert_eq!(parse_mem_bytes("-1Gi"), 0);
    }

    fn pod_with_requests(requests: Vec<(&str, &str)>) -> Pod {
        let containers = requests
            .into_iter()
            .map(|(cpu, mem)| Container {
                resources: Some(ResourceRequirements {
                    requests: Some(btreemap! {
                        "cpu".to_string() => Quantity(cpu.to_string()),
                        "memory".to_string() => Quantity(mem.to_string()),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect();
        Pod {
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pod_requests_sum_over_containers() {
        let pod = pod_with_requests(vec![("500m", "512Mi"), ("0.25", "1Ki")]);
        assert_eq!(pod_requests(&pod), (750, 512 * 1024 * 1024 + 1024));
    }

    #[test]
    fn pod_without_requests_contributes_zero() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![Container::default()],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(pod_requests(&pod), (0, 0));

        let empty = Pod::default();
        assert_eq!(pod_requests(&empty), (0, 0));
    }
}
