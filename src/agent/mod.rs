//! Management table walk.
//!
//! The management agent queries the entity tables (Connection, Link, Address,
//! Config) as ordered sequences: `get_first(offset)` then `get_next()` until
//! `more` goes false. Each call writes one response row, holding the
//! requested column subset, through the compose API. Walks run on the
//! router-core thread so table mutation is serialized by the action queue;
//! there is no stable cursor across walks, callers pass the next offset back.

use std::sync::{Arc, Mutex};

use crate::{
    codec::{Composer, Performative},
    link::{Connection, Link},
    sync::uptime_ticks,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    Connection,
    Link,
    Address,
    Config,
}

/// Connection table columns.
pub const CONNECTION_COLUMNS: [&str; 28] = [
    "name",
    "identity",
    "host",
    "role",
    "dir",
    "container",
    "sasl",
    "isAuthenticated",
    "user",
    "isEncrypted",
    "sslProto",
    "sslCipher",
    "properties",
    "sslSsf",
    "tenant",
    "type",
    "ssl",
    "opened",
    "active",
    "adminStatus",
    "operStatus",
    "uptimeSeconds",
    "lastDlvSeconds",
    "enableProtocolTrace",
    "meshId",
    "protocol",
    "inboundLinkCount",
    "outboundLinkCount",
];

/// Link table columns.
pub const LINK_COLUMNS: [&str; 28] = [
    "name",
    "identity",
    "type",
    "linkName",
    "linkType",
    "linkDir",
    "owningAddr",
    "capacity",
    "undeliveredCount",
    "unsettledCount",
    "deliveryCount",
    "connectionId",
    "operStatus",
    "presettledCount",
    "droppedPresettledCount",
    "acceptedCount",
    "rejectedCount",
    "releasedCount",
    "modifiedCount",
    "deliveriesDelayed1Sec",
    "deliveriesDelayed10Sec",
    "deliveriesStuck",
    "openMovedStreams",
    "ingressHistogram",
    "priority",
    "settleRate",
    "creditAvailable",
    "zeroCreditSeconds",
];

pub const ADDRESS_COLUMNS: [&str; 6] = [
    "name",
    "identity",
    "subscriberCount",
    "remoteCount",
    "deliveriesIngress",
    "deliveriesEgress",
];

pub const CONFIG_COLUMNS: [&str; 3] = ["name", "identity", "value"];

/// An address-table row as the core maintains it.
#[derive(Debug, Clone, Default)]
pub struct AddressRow {
    pub name: String,
    pub subscriber_count: u32,
    pub remote_count: u32,
    pub deliveries_ingress: u64,
    pub deliveries_egress: u64,
}

/// A config-table row.
#[derive(Debug, Clone, Default)]
pub struct ConfigRow {
    pub name: String,
    pub value: String,
}

/// The entity tables the core thread owns.
#[derive(Default)]
pub struct CoreTables {
    pub connections: Vec<Arc<Connection>>,
    pub links: Vec<Arc<Mutex<Link>>>,
    pub addresses: Vec<AddressRow>,
    pub configs: Vec<ConfigRow>,
}

impl CoreTables {
    fn len(&self, entity: EntityType) -> usize {
        match entity {
            EntityType::Connection => self.connections.len(),
            EntityType::Link => self.links.len(),
            EntityType::Address => self.addresses.len(),
            EntityType::Config => self.configs.len(),
        }
    }
}

/// One in-progress table walk.
pub struct Query {
    entity: EntityType,
    /// Indexes into the entity's column array.
    columns: Vec<usize>,
    pub next_offset: usize,
    pub more: bool,
    body: Composer,
    rows: usize,
}

impl Query {
    /// Starts a query for the named columns; unknown names are ignored.
    pub fn new(entity: EntityType, columns: &[&str]) -> Self {
        let all: &[&str] = match entity {
            EntityType::Connection => &CONNECTION_COLUMNS,
            EntityType::Link => &LINK_COLUMNS,
            EntityType::Address => &ADDRESS_COLUMNS,
            EntityType::Config => &CONFIG_COLUMNS,
        };
        let columns = columns
            .iter()
            .filter_map(|name| all.iter().position(|c| c == name))
            .collect();

        let mut body = Composer::new(Performative::AmqpValue);
        body.start_list();
        Self {
            entity,
            columns,
            next_offset: 0,
            more: false,
            body,
            rows: 0,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Ends the walk, returning the composed response body.
    pub fn finish(mut self) -> Composer {
        self.body.end_list();
        self.body
    }
}

/// Writes the row at `offset` and positions the query at the next one.
pub fn get_first(tables: &CoreTables, query: &mut Query, offset: usize) {
    if offset >= tables.len(query.entity) {
        query.more = false;
        return;
    }
    write_row(tables, query, offset);
    query.next_offset = offset + 1;
    query.more = query.next_offset < tables.len(query.entity);
}

/// Writes the row at the query's offset and advances.
pub fn get_next(tables: &CoreTables, query: &mut Query) {
    if query.next_offset >= tables.len(query.entity) {
        query.more = false;
        return;
    }
    write_row(tables, query, query.next_offset);
    query.next_offset += 1;
    query.more = query.next_offset < tables.len(query.entity);
}

fn write_row(tables: &CoreTables, query: &mut Query, offset: usize) {
    query.body.start_list();
    match query.entity {
        EntityType::Connection => {
            let conn = &tables.connections[offset];
            for &col in &query.columns {
                write_connection_column(&mut query.body, col, conn);
            }
        }
        EntityType::Link => {
            let mut link = tables.links[offset].lock().unwrap();
            for &col in &query.columns {
                write_link_column(&mut query.body, col, &mut link);
            }
        }
        EntityType::Address => {
            let addr = &tables.addresses[offset];
            for &col in &query.columns {
                write_address_column(&mut query.body, col, addr, offset);
            }
        }
        EntityType::Config => {
            let row = &tables.configs[offset];
            for &col in &query.columns {
                write_config_column(&mut query.body, col, row, offset);
            }
        }
    }
    query.body.end_list();
    query.rows += 1;
}

fn write_connection_column(body: &mut Composer, col: usize, conn: &Connection) {
    match CONNECTION_COLUMNS[col] {
        "name" => body.insert_string(&conn.name),
        "identity" => body.insert_string(&conn.identity.to_string()),
        "host" => body.insert_string(&conn.host),
        "role" => body.insert_string(conn.role.as_str()),
        "dir" => body.insert_string(if conn.dir_in { "in" } else { "out" }),
        "container" => body.insert_string(&conn.container_id),
        "type" => body.insert_string("io.weir.connection"),
        "opened" => body.insert_bool(true),
        "uptimeSeconds" => body.insert_uint(conn.uptime_seconds() as u32),
        _ => body.insert_null(),
    };
}

fn write_link_column(body: &mut Composer, col: usize, link: &mut Link) {
    match LINK_COLUMNS[col] {
        "name" | "linkName" => body.insert_string(&link.name),
        "identity" => body.insert_string(&link.identity.to_string()),
        "type" => body.insert_string("io.weir.router.link"),
        "linkType" => body.insert_string(link.link_type.as_str()),
        "linkDir" => body.insert_string(link.direction.as_str()),
        "owningAddr" => match &link.owning_addr {
            Some(addr) => body.insert_string(addr),
            None => body.insert_null(),
        },
        "capacity" => body.insert_uint(link.capacity),
        "undeliveredCount" => body.insert_ulong(link.undelivered_count() as u64),
        "unsettledCount" => body.insert_ulong(link.unsettled_count() as u64),
        "deliveryCount" => body.insert_ulong(link.total_deliveries),
        "connectionId" => body.insert_string(&link.conn_identity.to_string()),
        "operStatus" => body.insert_string(link.oper_status.as_str()),
        "presettledCount" => body.insert_ulong(link.presettled_deliveries),
        "droppedPresettledCount" => body.insert_ulong(link.dropped_presettled_deliveries),
        "acceptedCount" => body.insert_ulong(link.accepted_deliveries),
        "rejectedCount" => body.insert_ulong(link.rejected_deliveries),
        "releasedCount" => body.insert_ulong(link.released_deliveries),
        "modifiedCount" => body.insert_ulong(link.modified_deliveries),
        "deliveriesDelayed1Sec" => body.insert_ulong(link.deliveries_delayed_1sec),
        "deliveriesDelayed10Sec" => body.insert_ulong(link.deliveries_delayed_10sec),
        "deliveriesStuck" => body.insert_ulong(link.deliveries_stuck),
        "priority" => body.insert_uint(link.priority as u32),
        // Computed lazily: the ring advances to the current uptime tick
        // before it is read.
        "settleRate" => body.insert_uint(link.settle_rate(uptime_ticks()) as u32),
        "creditAvailable" => body.insert_uint(link.credit()),
        "zeroCreditSeconds" => body.insert_uint(link.zero_credit_seconds() as u32),
        _ => body.insert_null(),
    };
}

fn write_address_column(body: &mut Composer, col: usize, addr: &AddressRow, offset: usize) {
    match ADDRESS_COLUMNS[col] {
        "name" => body.insert_string(&addr.name),
        "identity" => body.insert_string(&offset.to_string()),
        "subscriberCount" => body.insert_uint(addr.subscriber_count),
        "remoteCount" => body.insert_uint(addr.remote_count),
        "deliveriesIngress" => body.insert_ulong(addr.deliveries_ingress),
        "deliveriesEgress" => body.insert_ulong(addr.deliveries_egress),
        _ => body.insert_null(),
    };
}

fn write_config_column(body: &mut Composer, col: usize, row: &ConfigRow, offset: usize) {
    match CONFIG_COLUMNS[col] {
        "name" => body.insert_string(&row.name),
        "identity" => body.insert_string(&offset.to_string()),
        "value" => body.insert_string(&row.value),
        _ => body.insert_null(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{ConnectionRole, Delivery, Disposition, LinkDirection, LinkType, Session};
    use crate::message::Message;

    fn tables() -> CoreTables {
        let mut tables = CoreTables::default();
        for i in 0..3u64 {
            let (conn, _waiter) = Connection::new(
                i,
                format!("conn{i}"),
                "127.0.0.1:5672",
                ConnectionRole::Normal,
                true,
                "app",
            );
            tables.connections.push(conn);

            let (session, _sw) = Session::new();
            tables.links.push(Arc::new(Mutex::new(Link::new(
                format!("link{i}"),
                100 + i,
                LinkType::Endpoint,
                LinkDirection::Outgoing,
                i,
                session,
            ))));
        }
        tables.addresses.push(AddressRow {
            name: "orders".into(),
            subscriber_count: 2,
            ..Default::default()
        });
        tables.configs.push(ConfigRow {
            name: "q2Upper".into(),
            value: "64".into(),
        });
        tables
    }

    #[test]
    fn test_walk_all_links() {
        let tables = tables();
        let mut query = Query::new(EntityType::Link, &["linkName", "connectionId", "creditAvailable"]);

        get_first(&tables, &mut query, 0);
        assert!(query.more);
        while query.more {
            get_next(&tables, &mut query);
        }
        assert_eq!(query.rows(), 3);
        assert_eq!(query.next_offset, 3);

        // The body is a well-formed composed section.
        let composer = query.finish();
        assert!(!composer.bytes().is_empty());
    }

    #[test]
    fn test_offset_beyond_table() {
        let tables = tables();
        let mut query = Query::new(EntityType::Connection, &["name"]);
        get_first(&tables, &mut query, 10);
        assert!(!query.more);
        assert_eq!(query.rows(), 0);
    }

    #[test]
    fn test_resume_from_offset() {
        // No stable cursor across walks: the caller passes the next offset
        // back and the walk picks up there.
        let tables = tables();

        let mut first = Query::new(EntityType::Link, &["linkName"]);
        get_first(&tables, &mut first, 0);
        let resume_at = first.next_offset;

        let mut second = Query::new(EntityType::Link, &["linkName"]);
        get_first(&tables, &mut second, resume_at);
        assert!(second.more);
        assert_eq!(second.next_offset, resume_at + 1);
    }

    #[test]
    fn test_settle_rate_column_advances_ring() {
        let tables = tables();
        {
            let mut link = tables.links[0].lock().unwrap();
            let d = Delivery::new(Message::new());
            link.deliver(d.clone());
            link.next_undelivered();
            link.settle(&d, Disposition::Accepted);
        }

        let mut query = Query::new(EntityType::Link, &["settleRate"]);
        get_first(&tables, &mut query, 0);
        assert_eq!(query.rows(), 1);
    }

    #[test]
    fn test_unknown_columns_ignored() {
        let query = Query::new(EntityType::Address, &["name", "noSuchColumn"]);
        assert_eq!(query.columns.len(), 1);
    }
}
