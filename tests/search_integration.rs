//! Federated search integration tests over a realistic inventory fixture.

use tempfile::TempDir;

use udb::config::Config;
use udb::model::{DhcpRecord, DnsRecord, DnsZone, Entity, Kind, RecordType, Subnet, User, Vrf};
use udb::net::{Cidr, Mac};
use udb::search::{self, SearchOptions};
use udb::App;

fn test_app() -> (TempDir, App) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.db_uri = temp_dir.path().join("test.db").to_string_lossy().into_owned();
    let app = App::bootstrap(config).unwrap();
    (temp_dir, app)
}

fn cidr(s: &str) -> Cidr {
    Cidr::parse_normalized(s).unwrap()
}

/// Thirteen-entity inventory: one user, one VRF, four subnets, three zones,
/// one DHCP reservation and three DNS records, with comments on the DMZ
/// subnet, the bfh.ch zone and the foo.bfh.ch record.
fn add_records(app: &App) {
    let user_id = app.create(None, Entity::User(User::new("test"))).unwrap();
    let author = Some(user_id);
    let vrf_id = app.create(author, Entity::Vrf(Vrf::new("(default)"))).unwrap();

    let mut dmz = Subnet::new("DMZ", vrf_id, vec![cidr("147.87.250.0/24")]);
    dmz.meta.notes = "public".into();
    let dmz_id = app.create(author, Entity::Subnet(dmz)).unwrap();
    app.comment(author, Kind::Subnet, dmz_id, "Message on subnet").unwrap();

    let mut main4 = Subnet::new("its-main-4", vrf_id, vec![cidr("147.87.0.0/16")]);
    main4.meta.notes = "main".into();
    app.create(author, Entity::Subnet(main4)).unwrap();

    let mut main6 = Subnet::new(
        "its-main-6",
        vrf_id,
        vec![cidr("2002::1234:abcd:ffff:c0a8:101/64")],
    );
    main6.meta.notes = "main".into();
    app.create(author, Entity::Subnet(main6)).unwrap();

    let mut arz = Subnet::new("ARZ", vrf_id, vec![cidr("147.87.208.0/24")]);
    arz.meta.notes = "BE.net".into();
    app.create(author, Entity::Subnet(arz)).unwrap();

    let mut zone = DnsZone::new("bfh.ch");
    zone.meta.notes = "DMZ Zone".into();
    zone.subnet_ids = vec![dmz_id];
    let zone_id = app.create(author, Entity::DnsZone(zone)).unwrap();
    app.comment(author, Kind::DnsZone, zone_id, "Here is a message").unwrap();

    let mut science = DnsZone::new("bfh.science");
    science.meta.notes = "This is a note".into();
    app.create(author, Entity::DnsZone(science)).unwrap();

    let mut info = DnsZone::new("bfh.info");
    info.meta.notes = "This is a note".into();
    app.create(author, Entity::DnsZone(info)).unwrap();

    let mut dhcp = DhcpRecord::new(
        "147.87.250.1".parse().unwrap(),
        Mac::parse("00:ba:d5:a2:34:56").unwrap(),
    );
    dhcp.meta.notes = "webserver bla bla bla".into();
    app.create(author, Entity::DhcpRecord(dhcp)).unwrap();

    let foo_id = app
        .create(
            author,
            Entity::DnsRecord(DnsRecord::new("foo.bfh.ch", RecordType::A, "147.87.250.3")),
        )
        .unwrap();
    app.comment(author, Kind::DnsRecord, foo_id, "This is a message").unwrap();

    app.create(
        author,
        Entity::DnsRecord(DnsRecord::new("bar.bfh.ch", RecordType::A, "147.87.250.1")),
    )
    .unwrap();
    app.create(
        author,
        Entity::DnsRecord(DnsRecord::new("baz.bfh.ch", RecordType::A, "147.87.250.2")),
    )
    .unwrap();
}

#[test]
fn test_search_by_summary() {
    let (_guard, app) = test_app();
    add_records(&app);

    let hits = search::query(&app.store, "DMZ", &SearchOptions::default()).unwrap();
    let mut summaries: Vec<String> = hits.iter().map(|h| h.summary.clone()).collect();
    summaries.sort();
    assert_eq!(summaries, vec!["DMZ", "bfh.ch"]);
}

#[test]
fn test_search_by_message_body() {
    let (_guard, app) = test_app();
    add_records(&app);

    let options = SearchOptions {
        include_messages: true,
        ..Default::default()
    };
    let hits = search::query(&app.store, "message", &options).unwrap();
    let mut summaries: Vec<String> = hits.iter().map(|h| h.summary.clone()).collect();
    summaries.sort();
    assert_eq!(
        summaries,
        vec!["DMZ", "bfh.ch", "foo.bfh.ch = 147.87.250.3 (A)"]
    );
}

#[test]
fn test_search_subnet_by_range_fragment() {
    let (_guard, app) = test_app();
    add_records(&app);

    let hits = search::query(&app.store, "147.87.250", &SearchOptions::default()).unwrap();
    let keys: Vec<(String, i64)> = hits.iter().map(|h| (h.model_name.clone(), h.model_id)).collect();
    assert!(keys.iter().any(|(name, _)| name == "subnet"));
    assert!(keys.iter().any(|(name, _)| name == "dnsrecord"));
    assert!(keys.iter().any(|(name, _)| name == "dhcprecord"));
}

#[test]
fn test_search_excludes_deleted_by_default() {
    let (_guard, app) = test_app();
    add_records(&app);

    let hits = search::query(&app.store, "ARZ", &SearchOptions::default()).unwrap();
    assert_eq!(hits.len(), 1);
    let (kind, id) = (Kind::Subnet, hits[0].model_id);
    app.soft_delete(None, kind, id).unwrap();

    let hits = search::query(&app.store, "ARZ", &SearchOptions::default()).unwrap();
    assert!(hits.is_empty());

    let with_deleted = SearchOptions {
        include_deleted: true,
        ..Default::default()
    };
    let hits = search::query(&app.store, "ARZ", &with_deleted).unwrap();
    assert_eq!(hits.len(), 1);
}

#[test]
fn test_search_negation_and_or() {
    let (_guard, app) = test_app();
    add_records(&app);

    // `main` matches both its-main subnets; negating the IPv6 one leaves one
    let hits = search::query(&app.store, "main -its-main-6", &SearchOptions::default()).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].summary, "its-main-4");

    let hits = search::query(&app.store, "DMZ OR ARZ", &SearchOptions::default()).unwrap();
    let mut summaries: Vec<String> = hits.iter().map(|h| h.summary.clone()).collect();
    summaries.sort();
    assert_eq!(summaries, vec!["ARZ", "DMZ", "bfh.ch"]);
}

#[test]
fn test_search_caps_results() {
    let (_guard, app) = test_app();
    let vrf_id = app.create(None, Entity::Vrf(Vrf::new("bulk"))).unwrap();
    for i in 0..120 {
        let mut subnet = Subnet::new(
            format!("bulk-{i}"),
            vrf_id,
            vec![cidr(&format!("10.{}.{}.0/24", i / 256, i % 256))],
        );
        subnet.meta.notes = "bulkload".into();
        app.create(None, Entity::Subnet(subnet)).unwrap();
    }

    let hits = search::query(&app.store, "bulkload", &SearchOptions::default()).unwrap();
    assert_eq!(hits.len(), search::MAX_RESULTS);
}

#[test]
fn test_rebuild_projection() {
    let (_guard, app) = test_app();
    add_records(&app);

    let before = search::query(&app.store, "DMZ", &SearchOptions::default()).unwrap();
    let rebuilt = search::rebuild(&app.store).unwrap();
    assert!(rebuilt >= 10, "all searchable entities reindexed, got {rebuilt}");
    let after = search::query(&app.store, "DMZ", &SearchOptions::default()).unwrap();
    assert_eq!(before.len(), after.len());
}
