//! Receiver discovery over mDNS (`_googlecast._tcp`), no system daemon needed.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent};

use crate::protocol::{ReceiverCapabilities, ReceiverTarget, DEFAULT_RECEIVER_PORT};

const CAST_SERVICE_TYPE: &str = "_googlecast._tcp.local.";
const CAST_SERVICE_SUFFIX: &str = "._googlecast._tcp.local.";
const DISCOVERY_POLL: Duration = Duration::from_millis(250);

/// TXT record fields of one resolved service.
#[derive(Debug, Clone, Default)]
struct ServiceRecord<'a> {
    fullname: &'a str,
    host: &'a str,
    port: u16,
    id: Option<&'a str>,
    friendly_name: Option<&'a str>,
    model: Option<&'a str>,
    capabilities: Option<&'a str>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn instance_name_from_fullname(fullname: &str) -> String {
    fullname
        .trim()
        .strip_suffix(CAST_SERVICE_SUFFIX)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(fullname)
        .trim_matches('.')
        .to_string()
}

fn target_from_record(record: &ServiceRecord<'_>, address: IpAddr) -> ReceiverTarget {
    let host = record.host.trim_end_matches('.').to_string();
    let port = if record.port == 0 {
        DEFAULT_RECEIVER_PORT
    } else {
        record.port
    };
    let name = non_empty(record.friendly_name)
        .map(ToString::to_string)
        .unwrap_or_else(|| instance_name_from_fullname(record.fullname));
    let id = non_empty(record.id)
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("{host}:{address}:{port}"));
    let capabilities = non_empty(record.capabilities)
        .and_then(|bits| bits.parse::<u32>().ok())
        .map(ReceiverCapabilities::from_bitmask)
        .unwrap_or_default();
    ReceiverTarget {
        id,
        name,
        model: non_empty(record.model).map(ToString::to_string).unwrap_or_default(),
        host,
        address,
        port,
        capabilities,
    }
}

fn target_from_resolved_service(service: &mdns_sd::ResolvedService) -> Option<ReceiverTarget> {
    // IPv4 first: the stream server binds IPv4 only.
    let mut v4_addresses: Vec<_> = service.get_addresses_v4().iter().copied().collect();
    v4_addresses.sort();
    let address = IpAddr::V4(*v4_addresses.first()?);
    let record = ServiceRecord {
        fullname: service.get_fullname(),
        host: service.get_hostname(),
        port: service.get_port(),
        id: service.get_property_val_str("id"),
        friendly_name: service.get_property_val_str("fn"),
        model: service.get_property_val_str("md"),
        capabilities: service.get_property_val_str("ca"),
    };
    Some(target_from_record(&record, address))
}

/// Browses for receivers during `window` and returns them sorted by name.
///
/// Discovery problems are logged and yield an empty list.
pub fn discover_receivers(window: Duration) -> Vec<ReceiverTarget> {
    let mdns = match ServiceDaemon::new() {
        Ok(mdns) => mdns,
        Err(err) => {
            warn!("Discovery: failed to start mDNS daemon: {}", err);
            return Vec::new();
        }
    };
    let browse_receiver = match mdns.browse(CAST_SERVICE_TYPE) {
        Ok(receiver) => receiver,
        Err(err) => {
            warn!("Discovery: failed to browse {}: {}", CAST_SERVICE_TYPE, err);
            let _ = mdns.shutdown();
            return Vec::new();
        }
    };

    let targets_by_id = collect_targets(Instant::now() + window, |timeout| {
        match browse_receiver.recv_timeout(timeout) {
            Ok(event) => BrowseStep::Event(event),
            Err(_) if browse_receiver.is_disconnected() => BrowseStep::Closed,
            Err(_) => BrowseStep::Idle,
        }
    });

    if let Err(err) = mdns.stop_browse(CAST_SERVICE_TYPE) {
        debug!("Discovery: failed to stop browse cleanly: {}", err);
    }
    let _ = mdns.shutdown();

    let mut targets: Vec<ReceiverTarget> = targets_by_id.into_values().collect();
    targets.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    info!("Discovery: found {} receiver(s)", targets.len());
    targets
}

enum BrowseStep {
    Event(ServiceEvent),
    Idle,
    Closed,
}

fn collect_targets(
    deadline: Instant,
    mut next_step: impl FnMut(Duration) -> BrowseStep,
) -> HashMap<String, ReceiverTarget> {
    let mut targets_by_id = HashMap::new();
    while Instant::now() < deadline {
        let timeout = deadline
            .saturating_duration_since(Instant::now())
            .min(DISCOVERY_POLL);
        match next_step(timeout) {
            BrowseStep::Event(ServiceEvent::ServiceResolved(service)) => {
                if let Some(target) = target_from_resolved_service(&service) {
                    debug!("Discovery: resolved {}", target);
                    targets_by_id.insert(target.id.clone(), target);
                }
            }
            BrowseStep::Event(_) | BrowseStep::Idle => {}
            BrowseStep::Closed => {
                warn!("Discovery: browse channel closed early");
                break;
            }
        }
    }
    targets_by_id
}

/// Picks the receiver whose friendly name matches `name`, ignoring case.
pub fn find_by_name<'a>(targets: &'a [ReceiverTarget], name: &str) -> Option<&'a ReceiverTarget> {
    let wanted = name.trim().to_lowercase();
    targets
        .iter()
        .find(|target| target.name.to_lowercase() == wanted)
}
