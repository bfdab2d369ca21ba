use crate::frame::frame_errors::ParseError;
use crate::frame::server_event_type::EventType;
use crate::frame::types;
use std::net::SocketAddr;

/// EVENT - a server push on stream id -1, delivered only to connections
/// that sent REGISTER.
#[derive(Debug, Clone)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug, Clone)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
}

#[derive(Debug, Clone)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

#[derive(Debug, Clone)]
pub enum SchemaChangeEvent {
    KeyspaceChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
    },
    TableChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        object_name: String,
    },
    TypeChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        type_name: String,
    },
    FunctionChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        function_name: String,
        arguments: Vec<String>,
    },
    AggregateChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        aggregate_name: String,
        arguments: Vec<String>,
    },
}

impl SchemaChangeEvent {
    /// The keyspace the change applies to.
    pub fn keyspace_name(&self) -> &str {
        match self {
            SchemaChangeEvent::KeyspaceChange { keyspace_name, .. }
            | SchemaChangeEvent::TableChange { keyspace_name, .. }
            | SchemaChangeEvent::TypeChange { keyspace_name, .. }
            | SchemaChangeEvent::FunctionChange { keyspace_name, .. }
            | SchemaChangeEvent::AggregateChange { keyspace_name, .. } => keyspace_name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
    Invalid,
}

impl Event {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let event_type: EventType = types::read_string(buf)?.parse()?;
        match event_type {
            EventType::TopologyChange => {
                Ok(Self::TopologyChange(TopologyChangeEvent::deserialize(buf)?))
            }
            EventType::StatusChange => Ok(Self::StatusChange(StatusChangeEvent::deserialize(buf)?)),
            EventType::SchemaChange => Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(buf)?)),
        }
    }
}

impl SchemaChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change_string = types::read_string(buf)?;
        let type_of_change = match type_of_change_string {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            _ => SchemaChangeType::Invalid,
        };

        let target = types::read_string(buf)?;
        let keyspace_affected = types::read_string(buf)?.to_string();

        match target {
            "KEYSPACE" => Ok(Self::KeyspaceChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
            }),
            "TABLE" => {
                let table_name = types::read_string(buf)?.to_string();
                Ok(Self::TableChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    object_name: table_name,
                })
            }
            "TYPE" => {
                let changed_type = types::read_string(buf)?.to_string();
                Ok(Self::TypeChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    type_name: changed_type,
                })
            }
            "FUNCTION" => {
                let function = types::read_string(buf)?.to_string();
                let arguments = read_arguments(buf)?;
                Ok(Self::FunctionChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    function_name: function,
                    arguments,
                })
            }
            "AGGREGATE" => {
                let name = types::read_string(buf)?.to_string();
                let arguments = read_arguments(buf)?;
                Ok(Self::AggregateChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    aggregate_name: name,
                    arguments,
                })
            }
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid target of schema change: {}",
                target
            ))),
        }
    }
}

fn read_arguments(buf: &mut &[u8]) -> Result<Vec<String>, ParseError> {
    let count = types::read_short(buf)?;
    let mut arguments = Vec::with_capacity(count as usize);
    for _ in 0..count {
        arguments.push(types::read_string(buf)?.to_string());
    }
    Ok(arguments)
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change = types::read_string(buf)?;
        let addr = types::read_inet(buf)?;

        match type_of_change {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid type of change ({}) in TopologyChangeEvent",
                type_of_change
            ))),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change = types::read_string(buf)?;
        let addr = types::read_inet(buf)?;

        match type_of_change {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid type of status change ({}) in StatusChangeEvent",
                type_of_change
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn make_event_body(parts: &[&str], addr: Option<SocketAddr>) -> Vec<u8> {
        let mut buf = Vec::new();
        for part in parts {
            types::write_string(part, &mut buf).unwrap();
        }
        if let Some(addr) = addr {
            types::write_inet(addr, &mut buf);
        }
        buf
    }

    #[test]
    fn deserialize_topology_change() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9042);
        let buf = make_event_body(&["TOPOLOGY_CHANGE", "NEW_NODE"], Some(addr));
        let event = Event::deserialize(&mut &buf[..]).unwrap();
        assert!(
            matches!(event, Event::TopologyChange(TopologyChangeEvent::NewNode(a)) if a == addr)
        );

        let buf = make_event_body(&["TOPOLOGY_CHANGE", "REMOVED_NODE"], Some(addr));
        let event = Event::deserialize(&mut &buf[..]).unwrap();
        assert!(
            matches!(event, Event::TopologyChange(TopologyChangeEvent::RemovedNode(a)) if a == addr)
        );
    }

    #[test]
    fn deserialize_status_change() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 9042);
        let buf = make_event_body(&["STATUS_CHANGE", "UP"], Some(addr));
        let event = Event::deserialize(&mut &buf[..]).unwrap();
        assert!(matches!(event, Event::StatusChange(StatusChangeEvent::Up(a)) if a == addr));

        let buf = make_event_body(&["STATUS_CHANGE", "DOWN"], Some(addr));
        let event = Event::deserialize(&mut &buf[..]).unwrap();
        assert!(matches!(event, Event::StatusChange(StatusChangeEvent::Down(a)) if a == addr));
    }

    #[test]
    fn deserialize_schema_change() {
        let buf = make_event_body(&["SCHEMA_CHANGE", "CREATED", "TABLE", "ks", "tab"], None);
        let event = Event::deserialize(&mut &buf[..]).unwrap();
        match event {
            Event::SchemaChange(SchemaChangeEvent::TableChange {
                change_type,
                keyspace_name,
                object_name,
            }) => {
                assert_eq!(change_type, SchemaChangeType::Created);
                assert_eq!(keyspace_name, "ks");
                assert_eq!(object_name, "tab");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn deserialize_unknown_event_type_fails() {
        let buf = make_event_body(&["SOMETHING_ELSE"], None);
        assert!(Event::deserialize(&mut &buf[..]).is_err());
    }
}
