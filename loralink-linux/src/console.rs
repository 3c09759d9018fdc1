//! Operator line commands on stdin and their replies.

use loralink_core::{Action, DeviceId, Event, LinkCore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Id,
    Status,
    List,
    /// PAIR ON / PAIR OFF: discovery beacons.
    Discovery(bool),
    Bind(DeviceId),
    Accept,
    Cancel,
    Send(String),
    Unpair,
    Help,
}

impl Command {
    /// Parse one line. Keywords are case-insensitive; `S` keeps its text verbatim.
    /// Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> anyhow::Result<Option<Command>> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(None);
        }
        let (word, rest) = match line.trim_start().split_once(' ') {
            Some((w, r)) => (w, r),
            None => (line.trim(), ""),
        };
        let cmd = match word.to_ascii_uppercase().as_str() {
            "ID" => Command::Id,
            "STATUS" => Command::Status,
            "LIST" => Command::List,
            "HELP" | "?" => Command::Help,
            "A" => Command::Accept,
            "C" => Command::Cancel,
            "UNPAIR" => Command::Unpair,
            "PAIR" => match rest.trim().to_ascii_uppercase().as_str() {
                "ON" => Command::Discovery(true),
                "OFF" => Command::Discovery(false),
                _ => anyhow::bail!("usage: PAIR ON|OFF"),
            },
            "B" => match DeviceId::parse_hex(rest) {
                Some(id) => Command::Bind(id),
                None => anyhow::bail!("usage: B <hexId>"),
            },
            "S" => {
                if rest.is_empty() {
                    anyhow::bail!("usage: S <message>");
                }
                Command::Send(rest.to_string())
            }
            other => anyhow::bail!("unknown command {:?} (HELP lists commands)", other),
        };
        Ok(Some(cmd))
    }
}

/// What a command produced: packets to transmit and lines for the operator.
#[derive(Debug, Default)]
pub struct Reply {
    pub actions: Vec<Action>,
    pub lines: Vec<String>,
}

impl Reply {
    fn line(text: impl Into<String>) -> Self {
        Reply {
            actions: Vec::new(),
            lines: vec![text.into()],
        }
    }
}

pub fn execute(core: &mut LinkCore, cmd: Command, now: u64) -> Reply {
    match cmd {
        Command::Id => Reply::line(format!("DeviceId: {}", core.device_id())),
        Command::Status => Reply {
            actions: Vec::new(),
            lines: status_lines(core, now),
        },
        Command::List => {
            let peers = core.discovered_peers();
            if peers.is_empty() {
                return Reply::line("[PAIR] no devices discovered");
            }
            let lines = peers
                .iter()
                .map(|p| {
                    format!(
                        "[PAIR] {} seen {} ms ago",
                        p.device_id,
                        now.saturating_sub(p.last_seen)
                    )
                })
                .collect();
            Reply {
                actions: Vec::new(),
                lines,
            }
        }
        Command::Discovery(on) => {
            core.set_discovery(on);
            Reply::line(format!("[PAIR] discovery mode: {}", if on { "ON" } else { "OFF" }))
        }
        Command::Bind(target) => match core.request_bind(target, now) {
            Ok(actions) => Reply {
                actions,
                lines: vec![format!("[BIND] requesting {}", target)],
            },
            Err(e) => Reply::line(format!("[BIND] {}", e)),
        },
        Command::Accept => match core.accept_bind(now) {
            Ok(actions) => Reply {
                actions,
                lines: vec!["[BIND] accepted, waiting for confirmation".to_string()],
            },
            Err(e) => Reply::line(format!("[BIND] {}", e)),
        },
        Command::Cancel => {
            let actions = core.cancel_bind();
            if actions.is_empty() {
                Reply::line("[BIND] nothing pending")
            } else {
                Reply {
                    actions,
                    lines: Vec::new(),
                }
            }
        }
        Command::Send(text) => match core.send_message(text.as_bytes()) {
            Ok(seq) => Reply::line(format!("[SEC] queued seq={}", seq)),
            Err(e) => Reply::line(format!("[SEC] {}", e)),
        },
        Command::Unpair => Reply {
            actions: core.unpair(),
            lines: vec!["[BIND] pairing cleared".to_string()],
        },
        Command::Help => Reply {
            actions: Vec::new(),
            lines: HELP.lines().map(str::to_string).collect(),
        },
    }
}

const HELP: &str = "\
ID             show this device id
STATUS         pairing and link status
LIST           discovered devices
PAIR ON|OFF    discovery beacons
B <hexId>      request pairing with a device
A              accept the pending request
C              cancel the pending request
S <message>    send an encrypted message
UNPAIR         forget the pairing";

fn status_lines(core: &LinkCore, now: u64) -> Vec<String> {
    let s = core.status(now);
    let mut lines = vec![
        format!("[STATUS] device: {}", s.device_id),
        format!("[STATUS] state: {:?}", s.state),
        format!("[STATUS] paired: {}", if s.paired { "yes" } else { "no" }),
        format!(
            "[STATUS] discovery mode: {}",
            if s.discovery_enabled { "ON" } else { "OFF" }
        ),
    ];
    if let Some(initiator) = s.pending_initiator {
        lines.push(format!("[STATUS] pending request from {}", initiator));
    }
    if s.paired {
        if let Some(peer) = s.peer {
            lines.push(format!("[STATUS] peer: {}", peer));
        }
        lines.push(format!(
            "[STATUS] peer online: {}",
            if s.peer_online { "yes" } else { "no" }
        ));
        if let Some(ago) = s.last_heartbeat_ago_ms {
            lines.push(format!("[STATUS] last heartbeat {} ms ago", ago));
        }
        if !s.pending_messages.is_empty() {
            lines.push(format!("[STATUS] awaiting ACK: {:?}", s.pending_messages));
        }
    }
    lines
}

/// One operator-facing line per event.
pub fn describe(event: &Event) -> String {
    match event {
        Event::BindRequested { initiator } => {
            format!("[BIND] request from {} (A to accept, C to cancel)", initiator)
        }
        Event::Paired { peer } => format!("[BIND] paired with {}", peer),
        Event::BindCancelled => "[BIND] request cancelled".to_string(),
        Event::BindExpired => "[BIND] request expired".to_string(),
        Event::MessageReceived { seq, payload } => {
            format!("[RX] seq={} {}", seq, String::from_utf8_lossy(payload))
        }
        Event::MessageDelivered { seq } => format!("[TX] seq={} delivered", seq),
        Event::DeliveryFailed { seq } => format!("[TX] seq={} not acknowledged, dropped", seq),
        Event::PeerOnline { peer } => format!("[HB] {} online", peer),
        Event::PeerOffline { peer } => format!("[HB] {} offline", peer),
        Event::PeerIdentified { peer } => format!("[HB] paired device is {}", peer),
        Event::PeerDiscovered { peer } => format!("[PAIR] discovered {}", peer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loralink_core::{MemoryKeyStore, PairingState, ProtocolConfig};

    fn core() -> LinkCore {
        let store = MemoryKeyStore::with_device_id(DeviceId::new(0x1111_2222));
        LinkCore::new(Box::new(store), ProtocolConfig::default()).unwrap()
    }

    fn parse(line: &str) -> Command {
        Command::parse(line).unwrap().unwrap()
    }

    #[test]
    fn parses_every_command() {
        assert_eq!(parse("ID"), Command::Id);
        assert_eq!(parse("status"), Command::Status);
        assert_eq!(parse("List\r\n"), Command::List);
        assert_eq!(parse("PAIR ON"), Command::Discovery(true));
        assert_eq!(parse("pair off"), Command::Discovery(false));
        assert_eq!(parse("B 33334444"), Command::Bind(DeviceId::new(0x3333_4444)));
        assert_eq!(parse("b 0xABCD"), Command::Bind(DeviceId::new(0xABCD)));
        assert_eq!(parse("a"), Command::Accept);
        assert_eq!(parse("C"), Command::Cancel);
        assert_eq!(parse("S hello  world "), Command::Send("hello  world ".into()));
        assert_eq!(parse("UNPAIR"), Command::Unpair);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(Command::parse("   ").unwrap().is_none());
        assert!(Command::parse("B").is_err());
        assert!(Command::parse("B xyz").is_err());
        assert!(Command::parse("PAIR maybe").is_err());
        assert!(Command::parse("S").is_err());
        assert!(Command::parse("RESET").is_err());
    }

    #[test]
    fn id_and_send_without_pairing() {
        let mut c = core();
        assert_eq!(execute(&mut c, Command::Id, 0).lines, vec!["DeviceId: 0x11112222"]);
        let reply = execute(&mut c, Command::Send("hi".into()), 0);
        assert!(reply.actions.is_empty());
        assert_eq!(reply.lines, vec!["[SEC] not paired"]);
    }

    #[test]
    fn bind_emits_request_and_cancel_notifies() {
        let mut c = core();
        let reply = execute(&mut c, Command::Bind(DeviceId::new(0x3333_4444)), 0);
        assert_eq!(reply.actions.len(), 1);
        assert!(matches!(&reply.actions[0], Action::Transmit(p) if p[0] == 0x20));
        assert_eq!(c.pairing_state(), PairingState::RequestSent);

        let reply = execute(&mut c, Command::Cancel, 10);
        assert!(matches!(
            reply.actions.as_slice(),
            [Action::Notify(Event::BindCancelled)]
        ));
        assert_eq!(
            execute(&mut c, Command::Cancel, 20).lines,
            vec!["[BIND] nothing pending"]
        );
        assert_eq!(
            execute(&mut c, Command::Accept, 30).lines,
            vec!["[BIND] no bind request to accept"]
        );
    }

    #[test]
    fn discovery_toggle_shows_in_status() {
        let mut c = core();
        execute(&mut c, Command::Discovery(true), 0);
        let lines = execute(&mut c, Command::Status, 0).lines;
        assert!(lines.contains(&"[STATUS] discovery mode: ON".to_string()));
        assert!(lines.contains(&"[STATUS] paired: no".to_string()));
        assert_eq!(
            execute(&mut c, Command::List, 0).lines,
            vec!["[PAIR] no devices discovered"]
        );
    }

    #[test]
    fn events_read_plainly() {
        let peer = DeviceId::new(0x3333_4444);
        assert_eq!(
            describe(&Event::Paired { peer }),
            "[BIND] paired with 0x33334444"
        );
        assert_eq!(
            describe(&Event::MessageReceived {
                seq: 7,
                payload: b"hello".to_vec()
            }),
            "[RX] seq=7 hello"
        );
    }
}
