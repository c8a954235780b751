diesel::table! {
    models (id) {
        id -> Integer,
        source -> Text,
        source_model_id -> Text,
        name -> Text,
        artist -> Nullable<Text>,
        source_url -> Text,
        license_type -> Nullable<Text>,
        license_url -> Nullable<Text>,
        acquired_at -> Text,
        file_path -> Text,
        file_type -> Text,
        original_format -> Nullable<Text>,
        size_bytes -> BigInt,
        thumbnail_path -> Nullable<Text>,
        notes -> Text,
    }
}
