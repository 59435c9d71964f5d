//! Importer integration tests: subnet CSV inventory and BIND AXFR dumps.

use tempfile::TempDir;

use udb::config::Config;
use udb::import;
use udb::model::{DnsZone, Entity, Kind, Subnet, Vrf};
use udb::net::Cidr;
use udb::store::Filter;
use udb::App;

const SUBNET_CSV: &str = "\
IPv6,IPv4,VRF,L3VNI,L2VNI,VLAN,TLD,Name,Description
2a07:6b40::/32 ,,infra,,,,,Infra,
2a07:6b40:0::/48,,client,14,,,bfh.info,all-anycast-infra,All: anycast Infrastructure
2a07:6b40:0::/48,,infra,10,,,bfh.info,all-anycast-infra,All: anycast Infrastructure
";

const ZONE_DUMP: &str = "\
;; AXFR for bfh.ch.
bfh.ch.             \t600\tIN\tSOA\tddns.bfh.info. bfh-linux-sysadmin.lists.bfh.science. 33317735 600 60 36000 3600
bfh.ch.             \t600\tIN\tA\t147.87.0.240
bfh.ch.             \t600\tIN\tNS\tnode1.ns.bfh.info.
";

fn test_app() -> (TempDir, App) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.db_uri = temp_dir.path().join("test.db").to_string_lossy().into_owned();
    let app = App::bootstrap(config).unwrap();
    (temp_dir, app)
}

#[test]
fn test_import_subnet_csv() {
    let (_guard, app) = test_app();
    let stats = import::import_file(&app, None, "subnet", SUBNET_CSV).unwrap();

    assert_eq!(stats.subnets, 3);
    assert_eq!(stats.vrfs, 2);
    assert_eq!(stats.zones, 1);
    assert_eq!(app.store.count(Kind::Subnet, &Filter::default()).unwrap(), 3);
    assert_eq!(app.store.count(Kind::Vrf, &Filter::default()).unwrap(), 2);

    // Leading/trailing whitespace in the range column is tolerated.
    let infra = app.store.find_vrf_by_name("infra").unwrap().unwrap();
    let filter = Filter {
        cidr: Some(Cidr::parse_normalized("2a07:6b40::/32").unwrap()),
        ..Filter::default()
    };
    let subnets = app
        .store
        .query(Kind::Subnet, &filter, Default::default())
        .unwrap();
    assert_eq!(subnets.len(), 3);
    assert!(subnets.iter().any(|s| match s {
        Entity::Subnet(s) => s.vrf_id == infra.meta.id.unwrap() && s.name == "Infra",
        _ => false,
    }));

    // The imported zone is linked to both /48 subnets.
    let zone = app.store.find_zone_by_name("bfh.info").unwrap().unwrap();
    assert_eq!(zone.subnet_ids.len(), 2);
}

#[test]
fn test_import_subnet_csv_is_idempotent_for_vrfs() {
    let (_guard, app) = test_app();
    app.create(None, Entity::Vrf(Vrf::new("infra"))).unwrap();
    let stats = import::import_subnet_csv(&app, None, SUBNET_CSV).unwrap();

    // The existing VRF is reused, only `client` is new.
    assert_eq!(stats.vrfs, 1);
    assert_eq!(app.store.count(Kind::Vrf, &Filter::default()).unwrap(), 2);
}

#[test]
fn test_import_subnet_csv_rejects_garbage() {
    let (_guard, app) = test_app();
    let bad = "IPv6,IPv4,VRF,L3VNI,L2VNI,VLAN,TLD,Name,Description\nnot-a-network,,infra,,,,,x,\n";
    assert!(import::import_subnet_csv(&app, None, bad).is_err());
    // Nothing is half-imported; VRF creation happens per name, so the failed
    // row may leave its VRF behind, but never a subnet.
    assert_eq!(app.store.count(Kind::Subnet, &Filter::default()).unwrap(), 0);

    assert!(import::import_subnet_csv(&app, None, "Name,Description\nx,y\n").is_err());
    assert!(import::import_file(&app, None, "nonsense", "x").is_err());
}

#[test]
fn test_import_zone_records() {
    let (_guard, app) = test_app();
    // The records need their zone and a covering allowed subnet.
    let vrf_id = app.create(None, Entity::Vrf(Vrf::new("default"))).unwrap();
    let subnet_id = app
        .create(
            None,
            Entity::Subnet(Subnet::new(
                "DMZ",
                vrf_id,
                vec![Cidr::parse_normalized("147.87.0.0/24").unwrap()],
            )),
        )
        .unwrap();
    let mut zone = DnsZone::new("bfh.ch");
    zone.subnet_ids = vec![subnet_id];
    app.create(None, Entity::DnsZone(zone)).unwrap();

    let stats = import::import_file(&app, None, "dnsrecord", ZONE_DUMP).unwrap();
    assert_eq!(stats.records, 3);
    assert_eq!(stats.skipped, 0);
    assert_eq!(
        app.store.count(Kind::DnsRecord, &Filter::default()).unwrap(),
        3
    );

    // The A record created its aggregate IP row.
    let ip = app
        .store
        .find_ip(&"147.87.0.240".parse().unwrap())
        .unwrap();
    assert!(ip.is_some());
}

#[test]
fn test_import_zone_records_without_zone_fails() {
    let (_guard, app) = test_app();
    // No bfh.ch zone exists: the enforced zone rule aborts the import.
    assert!(import::import_zone_records(&app, None, ZONE_DUMP).is_err());
    assert_eq!(
        app.store.count(Kind::DnsRecord, &Filter::default()).unwrap(),
        0
    );
}
