//! Shared fixtures for unit tests: a miniature admissions database.
use crate::database_sqlite::SqliteDatabase;

const SCHEMA: &[&str] = &[
    "CREATE TABLE json_patients (
        subject_id INTEGER PRIMARY KEY,
        gender TEXT,
        anchor_age INTEGER,
        anchor_year INTEGER,
        dod TEXT
    )",
    "CREATE TABLE json_admissions (
        hadm_id INTEGER PRIMARY KEY,
        subject_id INTEGER,
        admittime TEXT,
        dischtime TEXT,
        admission_type TEXT,
        admit_provider_id TEXT,
        admission_location TEXT,
        discharge_location TEXT,
        insurance TEXT,
        race TEXT
    )",
    "CREATE TABLE json_providers (
        provider_id TEXT PRIMARY KEY,
        npi INTEGER,
        dea TEXT
    )",
    "CREATE TABLE json_transfers (
        transfer_id INTEGER PRIMARY KEY,
        subject_id INTEGER,
        hadm_id INTEGER,
        eventtype TEXT,
        careunit TEXT,
        intime TEXT,
        outtime TEXT
    )",
    "CREATE TABLE staff_notes (
        note_id INTEGER PRIMARY KEY,
        body TEXT
    )",
];

const DATA: &[&str] = &[
    "INSERT INTO json_patients VALUES
        (10000032, 'F', 52, 2180, NULL),
        (10000033, 'M', 71, 2181, '2183-01-02'),
        (10000034, 'F', 34, 2179, NULL),
        (10000035, 'M', 45, 2182, NULL),
        (10000036, 'F', 63, 2180, NULL)",
    "INSERT INTO json_admissions VALUES
        (22595853, 10000032, '2180-05-06 22:23:00', '2180-05-07 17:15:00', 'URGENT', 'P874LG', 'TRANSFER FROM HOSPITAL', 'HOME', 'Other', 'WHITE'),
        (22841357, 10000032, '2180-06-26 18:27:00', '2180-06-27 18:49:00', 'EW EMER.', 'P09Q6Y', 'EMERGENCY ROOM', 'HOME', 'Medicaid', 'WHITE'),
        (25742920, 10000033, '2180-08-05 23:44:00', '2180-08-07 17:50:00', 'EW EMER.', 'P60CC5', 'EMERGENCY ROOM', 'HOSPICE', 'Medicare', 'BLACK'),
        (29079034, 10000034, '2180-07-23 12:35:00', '2180-07-25 17:55:00', 'ELECTIVE', 'P874LG', 'PHYSICIAN REFERRAL', 'HOME', 'Other', 'ASIAN'),
        (20626031, 10000035, '2181-01-10 08:00:00', '2181-01-15 11:30:00', 'URGENT', 'P09Q6Y', 'CLINIC REFERRAL', 'SKILLED NURSING FACILITY', 'Medicare', 'WHITE'),
        (21133938, 10000036, '2181-03-02 14:10:00', '2181-03-04 09:00:00', 'EW EMER.', 'P60CC5', 'EMERGENCY ROOM', 'HOME', 'Other', 'HISPANIC')",
    "INSERT INTO json_providers VALUES
        ('P874LG', 1234567890, 'AB1234563'),
        ('P09Q6Y', 1987654321, 'BC2345674'),
        ('P60CC5', 1122334455, NULL)",
    "INSERT INTO json_transfers VALUES
        (30000001, 10000032, 22595853, 'admit', 'Emergency Department', '2180-05-06 19:17:00', '2180-05-06 23:30:00'),
        (30000002, 10000032, 22595853, 'transfer', 'Medicine', '2180-05-06 23:30:00', '2180-05-07 17:15:00'),
        (30000003, 10000033, 25742920, 'admit', 'Emergency Department', '2180-08-05 20:58:00', '2180-08-06 01:44:00'),
        (30000004, 10000034, 29079034, 'discharge', 'Surgery', '2180-07-25 17:55:00', NULL)",
    "INSERT INTO staff_notes VALUES (1, 'internal')",
];

/// In-memory database with the admissions schema and a handful of rows
pub(crate) async fn seeded_database() -> SqliteDatabase {
    let db = SqliteDatabase::in_memory()
        .await
        .expect("in-memory database");
    for statement in SCHEMA.iter().chain(DATA.iter()) {
        sqlx::query(statement)
            .execute(db.pool())
            .await
            .expect("seed statement");
    }
    db
}

/// The single pooled connection must be acquirable again once a request has
/// returned. sqlx gives connections back from a spawned task, so this waits
/// on `acquire` rather than reading the idle count.
pub(crate) async fn assert_connection_released(db: &SqliteDatabase) {
    let session = tokio::time::timeout(std::time::Duration::from_secs(1), db.session()).await;
    assert!(
        matches!(session, Ok(Ok(_))),
        "pooled connection was not released"
    );
}
