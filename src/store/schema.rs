//! Database schema
//!
//! Uniqueness is scoped to live rows: every logical unique key is a partial
//! index conditioned on `status != 0`, so soft-deleted rows never collide
//! with live ones. Races between two requests inserting the same name
//! resolve through the database constraint.

/// Database migrations (each string is one migration)
pub(super) const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    -- Users
    CREATE TABLE user (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL,
        password TEXT,
        fullname TEXT NOT NULL DEFAULT '',
        email TEXT,
        role TEXT NOT NULL DEFAULT 'user',
        notes TEXT NOT NULL DEFAULT '',
        status INTEGER NOT NULL DEFAULT 2,
        owner_id INTEGER REFERENCES user(id),
        created_at TEXT NOT NULL,
        modified_at TEXT NOT NULL
    );

    CREATE UNIQUE INDEX user_username_unique_ix ON user(lower(username)) WHERE status != 0;
    -- An empty or absent email counts as "no value" and never collides.
    CREATE UNIQUE INDEX user_email_unique_ix ON user(lower(email))
        WHERE status != 0 AND email IS NOT NULL AND email != '';

    -- VRFs
    CREATE TABLE vrf (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        notes TEXT NOT NULL DEFAULT '',
        status INTEGER NOT NULL DEFAULT 2,
        owner_id INTEGER REFERENCES user(id),
        created_at TEXT NOT NULL,
        modified_at TEXT NOT NULL
    );

    CREATE UNIQUE INDEX vrf_name_unique_ix ON vrf(name) WHERE status != 0;

    -- Subnets and their CIDR ranges
    CREATE TABLE subnet (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL DEFAULT '',
        vrf_id INTEGER NOT NULL REFERENCES vrf(id),
        l3vni INTEGER NOT NULL DEFAULT -1,
        l2vni INTEGER NOT NULL DEFAULT -1,
        vlan INTEGER NOT NULL DEFAULT -1,
        dhcp INTEGER NOT NULL DEFAULT 0,
        range_string TEXT NOT NULL DEFAULT '',
        notes TEXT NOT NULL DEFAULT '',
        status INTEGER NOT NULL DEFAULT 2,
        owner_id INTEGER REFERENCES user(id),
        created_at TEXT NOT NULL,
        modified_at TEXT NOT NULL
    );

    -- vrf_id and subnet_status are denormalised from the parent subnet so
    -- the unique key and range lookups stay index-only.
    CREATE TABLE subnet_range (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        subnet_id INTEGER NOT NULL REFERENCES subnet(id) ON DELETE CASCADE,
        vrf_id INTEGER NOT NULL,
        subnet_status INTEGER NOT NULL DEFAULT 2,
        range TEXT NOT NULL,
        version INTEGER NOT NULL,
        start_ip BLOB NOT NULL,
        end_ip BLOB NOT NULL
    );

    CREATE UNIQUE INDEX subnet_range_vrf_unique_ix ON subnet_range(vrf_id, range)
        WHERE subnet_status != 0;
    CREATE INDEX subnet_range_order_ix ON subnet_range(vrf_id, version, start_ip);
    CREATE INDEX subnet_range_subnet_ix ON subnet_range(subnet_id);

    -- DNS zones
    CREATE TABLE dnszone (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        notes TEXT NOT NULL DEFAULT '',
        status INTEGER NOT NULL DEFAULT 2,
        owner_id INTEGER REFERENCES user(id),
        created_at TEXT NOT NULL,
        modified_at TEXT NOT NULL
    );

    CREATE UNIQUE INDEX dnszone_name_unique_ix ON dnszone(lower(name)) WHERE status != 0;

    CREATE TABLE dnszone_subnet (
        dnszone_id INTEGER NOT NULL REFERENCES dnszone(id) ON DELETE CASCADE,
        subnet_id INTEGER NOT NULL REFERENCES subnet(id) ON DELETE CASCADE,
        PRIMARY KEY (dnszone_id, subnet_id)
    );

    -- DNS records
    CREATE TABLE dnsrecord (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        type TEXT NOT NULL,
        ttl INTEGER NOT NULL DEFAULT 3600,
        value TEXT NOT NULL,
        generated_ip TEXT,
        notes TEXT NOT NULL DEFAULT '',
        status INTEGER NOT NULL DEFAULT 2,
        owner_id INTEGER REFERENCES user(id),
        created_at TEXT NOT NULL,
        modified_at TEXT NOT NULL
    );

    CREATE UNIQUE INDEX dnsrecord_identity_unique_ix ON dnsrecord(type, lower(name), value)
        WHERE status != 0;
    CREATE INDEX dnsrecord_name_ix ON dnsrecord(name);
    CREATE INDEX dnsrecord_generated_ip_ix ON dnsrecord(generated_ip);

    -- DHCP reservations
    CREATE TABLE dhcprecord (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ip TEXT NOT NULL,
        mac TEXT NOT NULL,
        notes TEXT NOT NULL DEFAULT '',
        status INTEGER NOT NULL DEFAULT 2,
        owner_id INTEGER REFERENCES user(id),
        created_at TEXT NOT NULL,
        modified_at TEXT NOT NULL
    );

    CREATE UNIQUE INDEX dhcprecord_identity_unique_ix ON dhcprecord(ip, mac) WHERE status != 0;
    CREATE INDEX dhcprecord_ip_ix ON dhcprecord(ip);
    CREATE INDEX dhcprecord_mac_ix ON dhcprecord(mac);

    -- Aggregate IP rows, synthesised on first reference
    CREATE TABLE ip (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ip TEXT NOT NULL,
        ip_sort BLOB NOT NULL,
        notes TEXT NOT NULL DEFAULT '',
        status INTEGER NOT NULL DEFAULT 2,
        owner_id INTEGER REFERENCES user(id),
        created_at TEXT NOT NULL,
        modified_at TEXT NOT NULL
    );

    CREATE UNIQUE INDEX ip_ip_unique_ix ON ip(ip) WHERE status != 0;
    CREATE INDEX ip_sort_ix ON ip(ip_sort);

    -- Aggregate MAC rows
    CREATE TABLE mac (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        mac TEXT NOT NULL,
        notes TEXT NOT NULL DEFAULT '',
        status INTEGER NOT NULL DEFAULT 2,
        owner_id INTEGER REFERENCES user(id),
        created_at TEXT NOT NULL,
        modified_at TEXT NOT NULL
    );

    CREATE UNIQUE INDEX mac_mac_unique_ix ON mac(mac) WHERE status != 0;

    -- Consistency rules
    CREATE TABLE rule (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        model_name TEXT NOT NULL,
        statement TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        severity INTEGER NOT NULL DEFAULT 0,
        builtin INTEGER NOT NULL DEFAULT 0,
        field TEXT,
        notes TEXT NOT NULL DEFAULT '',
        status INTEGER NOT NULL DEFAULT 2,
        owner_id INTEGER REFERENCES user(id),
        created_at TEXT NOT NULL,
        modified_at TEXT NOT NULL
    );

    CREATE UNIQUE INDEX rule_name_unique_ix ON rule(name) WHERE status != 0;

    CREATE TABLE rule_violation (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        rule_id INTEGER NOT NULL REFERENCES rule(id) ON DELETE CASCADE,
        model_name TEXT NOT NULL,
        model_id INTEGER NOT NULL,
        label TEXT NOT NULL,
        first_seen TEXT NOT NULL,
        last_seen TEXT NOT NULL
    );

    CREATE UNIQUE INDEX rule_violation_identity_ix ON rule_violation(rule_id, model_name, model_id);

    -- Audit messages: weak (model_name, model_id) link, no referential
    -- action, so the trail survives its parent.
    CREATE TABLE message (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        model_name TEXT NOT NULL,
        model_id INTEGER NOT NULL,
        author_id INTEGER REFERENCES user(id),
        type TEXT NOT NULL DEFAULT 'comment',
        body TEXT NOT NULL DEFAULT '',
        changes TEXT,
        date TEXT NOT NULL
    );

    CREATE INDEX message_model_ix ON message(model_name, model_id);
    CREATE INDEX message_date_ix ON message(date);

    CREATE TABLE follower (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        model_name TEXT NOT NULL,
        model_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL REFERENCES user(id)
    );

    CREATE UNIQUE INDEX follower_identity_ix ON follower(model_name, model_id, user_id);

    -- Per-scope tumbling-window hit counter; incremented atomically.
    CREATE TABLE ratelimit (
        scope TEXT NOT NULL,
        client TEXT NOT NULL,
        window_start INTEGER NOT NULL,
        hits INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (scope, client)
    );

    -- Authenticated sessions; logout clears user_id, the row is reusable.
    CREATE TABLE authsession (
        id TEXT PRIMARY KEY,
        user_id INTEGER REFERENCES user(id),
        persistent INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        expires_at TEXT NOT NULL
    );

    -- Materialised search projection over the federated entity kinds,
    -- refreshed by after-flush hooks.
    CREATE VIRTUAL TABLE search_index USING fts5(
        summary,
        notes,
        extra,
        model_name UNINDEXED,
        model_id UNINDEXED,
        status UNINDEXED,
        owner_id UNINDEXED,
        modified_at UNINDEXED
    );

    CREATE VIRTUAL TABLE message_search USING fts5(
        body,
        changes,
        model_name UNINDEXED,
        model_id UNINDEXED
    );
    "#,
];
