//! Port scoring and allocation
//!
//! Every active USB transport contributes a [`PortRequest`]: the ports it can
//! use and what it knows about them (user choice, last good port, the port
//! the application recommends). Each usable port gets a score; the highest
//! scores win, one port per transport and one transport per port.
//!
//! | Criterion                      | Points |
//! |--------------------------------|--------|
//! | transport is required          | 1      |
//! | port was selected by the user  | 8      |
//! | port is the last port used     | 4      |
//! | port is recommended            | 2      |
//! | port is already held           | 100    |

use super::{UsbPort, DEFAULT_BAUD_RATE};

/// One transport's view of the enumerated ports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRequest {
    pub transport_id: String,
    pub optional: bool,
    /// Ports left after the transport's filters, in enumeration order
    pub ports: Vec<UsbPort>,
    /// Port and baud rate the transport is currently connected on
    pub current: Option<(UsbPort, Option<u32>)>,
    pub user_selected_port: Option<String>,
    pub user_selected_baud_rate: Option<u32>,
    pub preferred_port: Option<String>,
    pub recommended_port: Option<String>,
    pub recommended_baud_rate: Option<u32>,
    pub default_baud_rate: Option<u32>,
}

/// A port handed to a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSelection {
    pub transport_id: String,
    pub port: UsbPort,
    pub baud_rate: u32,
    pub score: u32,
}

impl PortRequest {
    pub fn new(transport_id: impl Into<String>, ports: Vec<UsbPort>) -> Self {
        Self {
            transport_id: transport_id.into(),
            ports,
            ..Self::default()
        }
    }

    pub fn score(&self, port_name: &str) -> u32 {
        let matches = |name: &Option<String>| name.as_deref() == Some(port_name);

        let mut score = if self.optional { 0 } else { 1 };
        if matches(&self.user_selected_port) {
            score += 8;
        }
        if matches(&self.preferred_port) {
            score += 4;
        }
        if matches(&self.recommended_port) {
            score += 2;
        }
        score
    }

    /// Baud rate a newly picked port is opened with
    pub fn baud_rate(&self) -> u32 {
        self.user_selected_baud_rate
            .or(self.recommended_baud_rate)
            .or(self.default_baud_rate)
            .unwrap_or(DEFAULT_BAUD_RATE)
    }

    /// Scored candidates, in port order
    pub fn candidates(&self) -> Vec<PortSelection> {
        if let Some((port, baud_rate)) = &self.current {
            return vec![PortSelection {
                transport_id: self.transport_id.clone(),
                port: port.clone(),
                baud_rate: baud_rate
                    .or(self.default_baud_rate)
                    .unwrap_or(DEFAULT_BAUD_RATE),
                score: 100,
            }];
        }

        let baud_rate = self.baud_rate();
        self.ports
            .iter()
            .filter(|port| !port.is_opened)
            .map(|port| PortSelection {
                transport_id: self.transport_id.clone(),
                port: port.clone(),
                baud_rate,
                score: self.score(&port.name),
            })
            .collect()
    }
}

/// Assign ports to transports, best score first
///
/// Ties keep request order, then port order.
pub fn allocate_ports(requests: &[PortRequest]) -> Vec<PortSelection> {
    let mut scores: Vec<PortSelection> = requests.iter().flat_map(PortRequest::candidates).collect();
    scores.sort_by(|a, b| b.score.cmp(&a.score));

    let mut picks = Vec::new();
    while !scores.is_empty() {
        let pick = scores.remove(0);
        scores.retain(|s| !s.port.same_port(&pick.port) && s.transport_id != pick.transport_id);
        picks.push(pick);
    }
    picks
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ports(names: &[&str]) -> Vec<UsbPort> {
        names.iter().map(|n| UsbPort::serial(*n)).collect()
    }

    #[test]
    fn test_score_weights() {
        let mut request = PortRequest::new("usb", ports(&["COM1"]));
        assert_eq!(request.score("COM1"), 1);

        request.user_selected_port = Some("COM1".into());
        request.preferred_port = Some("COM1".into());
        request.recommended_port = Some("COM1".into());
        assert_eq!(request.score("COM1"), 15);

        request.optional = true;
        assert_eq!(request.score("COM1"), 14);
        assert_eq!(request.score("COM2"), 0);
    }

    #[test]
    fn test_baud_rate_precedence() {
        let mut request = PortRequest::new("usb", vec![]);
        assert_eq!(request.baud_rate(), 9600);
        request.default_baud_rate = Some(57600);
        assert_eq!(request.baud_rate(), 57600);
        request.recommended_baud_rate = Some(115200);
        assert_eq!(request.baud_rate(), 115200);
        request.user_selected_baud_rate = Some(19200);
        assert_eq!(request.baud_rate(), 19200);
    }

    #[test]
    fn test_opened_ports_are_skipped() {
        let mut available = ports(&["COM1", "COM2"]);
        available[0].is_opened = true;
        let request = PortRequest::new("usb", available);

        let picks = allocate_ports(&[request.clone()]);
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].port.name, "COM2");
        assert_eq!(request.ports.len(), 2);
    }

    #[test]
    fn test_current_port_wins() {
        let mut holder = PortRequest::new("a", ports(&["COM1", "COM2"]));
        holder.current = Some((UsbPort::serial("COM2"), Some(115200)));
        let mut other = PortRequest::new("b", ports(&["COM1", "COM2"]));
        other.user_selected_port = Some("COM2".into());

        let picks = allocate_ports(&[other, holder]);
        assert_eq!(picks[0].transport_id, "a");
        assert_eq!(picks[0].port.name, "COM2");
        assert_eq!(picks[0].baud_rate, 115200);
        assert_eq!(picks[0].score, 100);
        assert_eq!(picks[1].transport_id, "b");
        assert_eq!(picks[1].port.name, "COM1");
    }

    #[test]
    fn test_required_transport_goes_first() {
        let mut optional = PortRequest::new("opt", ports(&["COM1"]));
        optional.optional = true;
        let required = PortRequest::new("req", ports(&["COM1"]));

        let picks = allocate_ports(&[optional, required]);
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].transport_id, "req");
    }

    #[test]
    fn test_ties_follow_request_then_port_order() {
        let a = PortRequest::new("a", ports(&["COM1", "COM2"]));
        let b = PortRequest::new("b", ports(&["COM1", "COM2"]));

        let picks = allocate_ports(&[a, b]);
        let assigned: Vec<_> = picks.iter().map(|p| (p.transport_id.as_str(), p.port.name.as_str())).collect();
        assert_eq!(assigned, vec![("a", "COM1"), ("b", "COM2")]);
    }

    #[test]
    fn test_user_selection_beats_preference() {
        let mut a = PortRequest::new("a", ports(&["COM1", "COM2"]));
        a.preferred_port = Some("COM1".into());
        a.user_selected_port = Some("COM2".into());

        let picks = allocate_ports(&[a]);
        assert_eq!(picks[0].port.name, "COM2");
        assert_eq!(picks[0].score, 9);
    }

    fn any_request() -> impl Strategy<Value = PortRequest> {
        (
            prop::collection::vec(0u8..6, 0..6),
            any::<bool>(),
            prop::option::of(0u8..6),
            prop::option::of(0u8..6),
        )
            .prop_map(|(names, optional, user, preferred)| PortRequest {
                ports: names.iter().map(|n| UsbPort::serial(format!("COM{}", n))).collect(),
                optional,
                user_selected_port: user.map(|n| format!("COM{}", n)),
                preferred_port: preferred.map(|n| format!("COM{}", n)),
                ..PortRequest::default()
            })
    }

    proptest! {
        #[test]
        fn test_allocation_is_exclusive(requests in prop::collection::vec(any_request(), 0..5)) {
            let requests: Vec<_> = requests
                .into_iter()
                .enumerate()
                .map(|(i, mut r)| { r.transport_id = format!("t{}", i); r })
                .collect();
            let picks = allocate_ports(&requests);

            for (i, a) in picks.iter().enumerate() {
                for b in &picks[i + 1..] {
                    prop_assert_ne!(&a.transport_id, &b.transport_id);
                    prop_assert!(!a.port.same_port(&b.port));
                }
                prop_assert!(picks[i..].iter().all(|b| b.score <= a.score));
            }
        }

        #[test]
        fn test_allocation_is_deterministic(requests in prop::collection::vec(any_request(), 0..5)) {
            prop_assert_eq!(allocate_ports(&requests), allocate_ports(&requests));
        }
    }
}
