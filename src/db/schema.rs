pub const CREATE_LOCATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS locations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    total_pages INTEGER,
    created_at DATETIME NOT NULL
);
"#;

pub const CREATE_PHOTOS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS photos (
    location_id INTEGER NOT NULL REFERENCES locations(id) ON DELETE CASCADE,
    remote_id TEXT NOT NULL,
    image_url TEXT NOT NULL,
    image_data BLOB,
    PRIMARY KEY (location_id, remote_id)
);
"#;

pub const CREATE_TOMBSTONES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tombstones (
    location_id INTEGER NOT NULL REFERENCES locations(id) ON DELETE CASCADE,
    remote_id TEXT NOT NULL,
    created_at DATETIME NOT NULL,
    PRIMARY KEY (location_id, remote_id)
);
"#;
