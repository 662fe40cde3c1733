use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use fleetslot::engine::Engine;
use fleetslot::wire::{self, FleetslotFactory};

const DAY: &str = "2099-01-05";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("fleetslot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("fleetslot.wal")).unwrap());
    let factory = Arc::new(FleetslotFactory::new(engine, "fleetslot".to_string()).unwrap());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("fleet")
        .user("fleetslot")
        .password("fleetslot");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.batch_execute(sql).await.unwrap_err();
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_else(|| panic!("expected a server error, got {err}"))
}

/// Registers one vehicle and one user of the same company.
async fn seed(client: &Client) -> (Ulid, Ulid) {
    let vid = Ulid::new();
    let uid = Ulid::new();
    let plate = format!("T{}", &vid.to_string()[20..]);
    client
        .batch_execute(&format!(
            "INSERT INTO vehicles (id, company, plate, brand, model, vehicle_type) \
             VALUES ('{vid}', 'Acme', '{plate}', 'Toyota', 'Hilux', 'Pickup')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, full_name, company) VALUES ('{uid}', 'Ana Rojas', 'Acme')"
        ))
        .await
        .unwrap();
    (vid, uid)
}

fn book_sql(vid: Ulid, uid: Ulid, starts: &[&str]) -> String {
    let values: Vec<String> = starts
        .iter()
        .map(|s| format!("('{vid}', '{uid}', '{DAY}', '{s}')"))
        .collect();
    format!(
        "INSERT INTO reservations (vehicle_id, user_id, date, start_time) VALUES {}",
        values.join(", ")
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn slots_lists_the_day() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let slots = rows(&client, "SELECT * FROM slots").await;
    assert_eq!(slots.len(), 10);
    assert_eq!(slots[0].get("label"), Some("08:00 - 09:00"));
    assert_eq!(slots[9].get("start"), Some("17:00"));
}

#[tokio::test]
async fn book_then_read_availability() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let (vid, uid) = seed(&client).await;

    client.batch_execute(&book_sql(vid, uid, &["09:00", "10:00"])).await.unwrap();

    let avail = rows(
        &client,
        &format!(
            "SELECT * FROM availability WHERE vehicle_id = '{vid}' AND date = '{DAY}' AND user_id = '{uid}'"
        ),
    )
    .await;
    assert_eq!(avail.len(), 10);
    let taken: Vec<_> = avail
        .iter()
        .filter(|r| r.get("available") == Some("f"))
        .map(|r| r.get("start").unwrap().to_string())
        .collect();
    assert_eq!(taken, vec!["09:00", "10:00"]);
    assert_eq!(avail[1].get("booked_by_me"), Some("t"));
    let booked_by = uid.to_string();
    assert_eq!(avail[1].get("booked_by"), Some(booked_by.as_str()));

    let reservations = rows(
        &client,
        &format!("SELECT * FROM reservations WHERE vehicle_id = '{vid}' AND date = '{DAY}'"),
    )
    .await;
    assert_eq!(reservations.len(), 2);
    assert_eq!(reservations[0].get("end_time"), Some("10:00"));
}

#[tokio::test]
async fn conflict_across_connections() {
    let addr = start_test_server().await;
    let first = connect(addr).await;
    let second = connect(addr).await;
    let (vid, uid) = seed(&first).await;

    let rival = Ulid::new();
    second
        .batch_execute(&format!(
            "INSERT INTO users (id, full_name, company) VALUES ('{rival}', 'Luis Soto', 'Acme')"
        ))
        .await
        .unwrap();

    first.batch_execute(&book_sql(vid, uid, &["14:00"])).await.unwrap();
    assert_eq!(sqlstate(&second, &book_sql(vid, rival, &["13:00", "14:00"])).await, "23505");

    // The losing request left nothing behind.
    let reservations = rows(
        &first,
        &format!("SELECT * FROM reservations WHERE vehicle_id = '{vid}' AND date = '{DAY}'"),
    )
    .await;
    assert_eq!(reservations.len(), 1);
}

#[tokio::test]
async fn error_codes() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let (vid, uid) = seed(&client).await;

    assert_eq!(sqlstate(&client, &book_sql(vid, uid, &["07:00"])).await, "22023");
    assert_eq!(sqlstate(&client, &book_sql(Ulid::new(), uid, &["09:00"])).await, "P0002");
    let past = format!(
        "INSERT INTO reservations VALUES ('{vid}', '{uid}', '2000-01-03', '09:00')"
    );
    assert_eq!(sqlstate(&client, &past).await, "22007");
    assert_eq!(sqlstate(&client, "SELECT * FROM nowhere").await, "42601");

    let outsider = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, full_name, company) VALUES ('{outsider}', 'Eve', 'Globex')"
        ))
        .await
        .unwrap();
    assert_eq!(sqlstate(&client, &book_sql(vid, outsider, &["09:00"])).await, "42501");
}

#[tokio::test]
async fn company_availability_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let (vid, uid) = seed(&client).await;
    client.batch_execute(&book_sql(vid, uid, &["16:00"])).await.unwrap();

    let fleet = rows(
        &client,
        &format!("SELECT * FROM company_availability WHERE user_id = '{uid}' AND date = '{DAY}'"),
    )
    .await;
    assert_eq!(fleet.len(), 10);
    assert!(fleet.iter().all(|r| r.get("vehicle_id") == Some(vid.to_string().as_str())));
    let mine: Vec<_> = fleet
        .iter()
        .filter(|r| r.get("booked_by_me") == Some("t"))
        .map(|r| r.get("start").unwrap().to_string())
        .collect();
    assert_eq!(mine, vec!["16:00"]);
}

#[tokio::test]
async fn extended_protocol_parameters() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let (vid, uid) = seed(&client).await;
    client.batch_execute(&book_sql(vid, uid, &["12:00"])).await.unwrap();

    let stmt = "SELECT * FROM reservations WHERE vehicle_id = $1 AND date = $2";
    let result = client
        .query(stmt, &[&vid.to_string(), &DAY])
        .await
        .unwrap();
    assert_eq!(result.len(), 1);
    let start: String = result[0].get("start_time");
    assert_eq!(start, "12:00");
}

#[tokio::test]
async fn bound_values_containing_placeholders_stay_literal() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let uid = Ulid::new().to_string();
    client
        .execute(
            "INSERT INTO users (id, full_name, company, city) VALUES ($1, $2, $3, $4)",
            &[&uid, &"Ana O'Neil $3", &"Acme", &"Price $1 town"],
        )
        .await
        .unwrap();

    let users = rows(&client, "SELECT * FROM users").await;
    let ana = users
        .iter()
        .find(|r| r.get("id") == Some(uid.as_str()))
        .expect("user registered");
    assert_eq!(ana.get("full_name"), Some("Ana O'Neil $3"));
    assert_eq!(ana.get("company"), Some("Acme"));
    assert_eq!(ana.get("city"), Some("Price $1 town"));
}

#[tokio::test]
async fn statement_batches_are_rejected_whole() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let (a, b) = (Ulid::new(), Ulid::new());
    let batch = format!(
        "INSERT INTO users (id, full_name, company) VALUES ('{a}', 'Ana', 'Acme'); \
         INSERT INTO users (id, full_name, company) VALUES ('{b}', 'Bea', 'Acme')"
    );
    assert_eq!(sqlstate(&client, &batch).await, "42601");
    assert!(rows(&client, "SELECT * FROM users").await.is_empty());

    let narrowed = "SELECT * FROM users WHERE company = 'Acme'";
    assert_eq!(sqlstate(&client, narrowed).await, "42601");
}
