pub const SCHEMA: &str = r#"
-- Uploaded media: images and videos
CREATE TABLE IF NOT EXISTS media_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL,
    filepath TEXT NOT NULL,
    file_type TEXT NOT NULL,              -- 'image' or 'video'
    status TEXT NOT NULL DEFAULT 'uploaded',  -- 'uploaded', 'annotated', 'processed'
    upload_time TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_media_files_status ON media_files(status);
CREATE INDEX IF NOT EXISTS idx_media_files_upload_time ON media_files(upload_time);

-- Behavior labels attached to an image or a sampled video frame
CREATE TABLE IF NOT EXISTS annotations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    media_id INTEGER NOT NULL,
    frame_index REAL,                     -- NULL for whole-image annotations
    behavior TEXT NOT NULL,
    coordinates TEXT,                     -- opaque, e.g. serialized box/polygon
    annotator TEXT NOT NULL DEFAULT 'system',
    created_at TEXT NOT NULL,
    FOREIGN KEY (media_id) REFERENCES media_files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_annotations_media ON annotations(media_id);

-- Trained classifier artifacts
CREATE TABLE IF NOT EXISTS models (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_name TEXT NOT NULL,
    model_path TEXT NOT NULL,
    training_time TEXT NOT NULL,
    training_data_size INTEGER NOT NULL,
    accuracy REAL,
    precision REAL,
    recall REAL,
    checksum TEXT                         -- SHA-256 of the artifact file
);

CREATE INDEX IF NOT EXISTS idx_models_training_time ON models(training_time);

-- Evaluation history (append-only)
CREATE TABLE IF NOT EXISTS evaluations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_id INTEGER NOT NULL,
    media_id INTEGER NOT NULL,
    evaluation_time TEXT NOT NULL,
    correct_predictions INTEGER NOT NULL,
    total_predictions INTEGER NOT NULL,
    accuracy REAL NOT NULL,
    FOREIGN KEY (model_id) REFERENCES models(id) ON DELETE CASCADE,
    FOREIGN KEY (media_id) REFERENCES media_files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_evaluations_model ON evaluations(model_id);

-- Behavior vocabulary: key -> display label
CREATE TABLE IF NOT EXISTS behaviors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    value TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Training runs; at most one row has running = 1
CREATE TABLE IF NOT EXISTS training_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    phase TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    message TEXT NOT NULL,
    running INTEGER NOT NULL DEFAULT 1,
    accuracy REAL,
    model_id INTEGER,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_training_jobs_running ON training_jobs(running);
"#;
