pub const CREATE_TEXT_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS CutItems (
        id TEXT PRIMARY KEY NOT NULL,
        content TEXT NOT NULL,
        createTime INTEGER NOT NULL
    )
";

pub const CREATE_IMAGE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS ImageItems (
        id TEXT PRIMARY KEY NOT NULL,
        content TEXT NOT NULL,
        width INTEGER NOT NULL,
        height INTEGER NOT NULL,
        size INTEGER NOT NULL,
        createTime INTEGER NOT NULL
    )
";

pub const TEXT_TABLE: &str = "CutItems";
pub const IMAGE_TABLE: &str = "ImageItems";
