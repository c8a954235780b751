//! Archive extraction and file-type classification for downloaded payloads.
//!
//! Classification sniffs the actual content (magic bytes, container
//! signatures) rather than trusting the provider's declared format; a
//! mismatch becomes a note on the record, never an error. The only failure
//! mode here is storage I/O - an unidentifiable payload is still cataloged.

use std::fs::{self, File};
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::ClassifyError;
use crate::models::SourceId;
use crate::sources::Payload;

const GLB_MAGIC: &[u8] = b"glTF";
const FBX_MAGIC: &[u8] = b"Kaydara FBX Binary";
const BLEND_MAGIC: &[u8] = b"BLENDER";

/// 3D formats eligible to be a record's primary artifact, in preference
/// order.
const PRIMARY_FORMATS: &[&str] = &["vrm", "glb", "gltf", "fbx", "obj", "blend"];

/// Formats that need external tooling before they can be previewed as VRM.
const CONVERTIBLE_FORMATS: &[&str] = &["glb", "gltf", "fbx", "obj", "blend"];

/// Result of classifying and storing one payload.
#[derive(Debug, Clone)]
pub struct ClassifiedArtifact {
    /// Stored primary artifact, relative to the data root.
    pub file_path: String,
    pub file_type: String,
    /// Container format before extraction, when the primary came out of one.
    pub original_format: Option<String>,
    /// Size of the stored artifact - never the adapter's declared length.
    pub size_bytes: u64,
    pub notes: Vec<String>,
}

enum ExtractOutcome {
    /// Entry names, in archive order.
    Extracted(Vec<String>),
    /// The container could not be read; reason recorded as a note.
    Unreadable(String),
}

/// Classifier bound to the on-disk data layout:
/// `<data_root>/raw/<source>/` for downloaded artifacts and
/// `<data_root>/extracted/<source>/<model_id>/` for archive contents.
#[derive(Debug, Clone)]
pub struct Classifier {
    data_root: PathBuf,
}

impl Classifier {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    /// Classify a downloaded payload and store the artifact.
    pub fn classify(
        &self,
        source: SourceId,
        model_id: &str,
        payload: &Payload,
        format_hint: Option<&str>,
    ) -> Result<ClassifiedArtifact, ClassifyError> {
        let mut notes = vec![format!(
            "sha256:{}",
            hex::encode(Sha256::digest(&payload.bytes))
        )];

        let hint = format_hint.map(normalize_format);
        let sniffed = sniff_format(&payload.bytes, hint.as_deref());

        if let Some(hint) = hint.as_deref() {
            if !formats_compatible(&sniffed, hint) {
                notes.push(format!(
                    "declared format '{hint}' but content sniffed as '{sniffed}'"
                ));
            }
        }

        if sniffed == "zip" {
            return self.classify_archive(source, model_id, payload, hint.as_deref(), notes);
        }

        // The model id is the stem; the server-declared filename contributes
        // only its extension.
        let extension = payload
            .filename
            .as_deref()
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .map(normalize_format)
            .unwrap_or_else(|| sniffed.clone());
        let dest = self
            .raw_dir(source)
            .join(format!("{}.{extension}", sanitize_filename(model_id)));
        write_atomic(&dest, &payload.bytes)?;

        if CONVERTIBLE_FORMATS.contains(&sniffed.as_str()) {
            notes.push(conversion_note(&sniffed));
        }

        let size_bytes = fs::metadata(&dest)?.len();
        debug!("Stored {} ({} bytes, {})", dest.display(), size_bytes, sniffed);

        Ok(ClassifiedArtifact {
            file_path: self.relative(&dest),
            file_type: sniffed,
            original_format: None,
            size_bytes,
            notes,
        })
    }

    /// Store a preview image fetched for a model; returns the relative path.
    pub fn store_thumbnail(
        &self,
        source: SourceId,
        model_id: &str,
        bytes: &[u8],
    ) -> Result<String, ClassifyError> {
        let ext = infer::get(bytes)
            .map(|kind| kind.extension())
            .unwrap_or("png");
        let dest = self
            .raw_dir(source)
            .join(format!("{}_thumb.{ext}", sanitize_filename(model_id)));
        write_atomic(&dest, bytes)?;
        Ok(self.relative(&dest))
    }

    fn classify_archive(
        &self,
        source: SourceId,
        model_id: &str,
        payload: &Payload,
        hint: Option<&str>,
        mut notes: Vec<String>,
    ) -> Result<ClassifiedArtifact, ClassifyError> {
        let safe_id = sanitize_filename(model_id);
        let archive_path = self.raw_dir(source).join(format!("{safe_id}.zip"));
        write_atomic(&archive_path, &payload.bytes)?;

        let extract_dir = self
            .data_root
            .join("extracted")
            .join(source.as_str())
            .join(&safe_id);

        match extract_zip(&payload.bytes, &extract_dir)? {
            ExtractOutcome::Extracted(entries) => {
                info!(
                    "Extracted {} entries from {} archive {}",
                    entries.len(),
                    source,
                    safe_id
                );
                notes.push(format!("archive contents: {}", entries.join(", ")));

                let files = collect_files(&extract_dir)?;
                if let Some((primary, file_type)) = select_primary(&files, hint) {
                    if CONVERTIBLE_FORMATS.contains(&file_type.as_str()) {
                        notes.push(conversion_note(&file_type));
                    }
                    let size_bytes = fs::metadata(&primary)?.len();
                    return Ok(ClassifiedArtifact {
                        file_path: self.relative(&primary),
                        file_type,
                        original_format: Some("zip".to_string()),
                        size_bytes,
                        notes,
                    });
                }

                notes.push(
                    "no supported 3D asset identified; manual conversion required".to_string(),
                );
            }
            ExtractOutcome::Unreadable(reason) => {
                notes.push(format!("zip extraction failed: {reason}"));
            }
        }

        // No usable inner asset - the archive itself is the cataloged
        // artifact.
        let size_bytes = fs::metadata(&archive_path)?.len();
        Ok(ClassifiedArtifact {
            file_path: self.relative(&archive_path),
            file_type: "zip".to_string(),
            original_format: None,
            size_bytes,
            notes,
        })
    }

    fn raw_dir(&self, source: SourceId) -> PathBuf {
        self.data_root.join("raw").join(source.as_str())
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.data_root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}

/// Determine the logical file type from content, consulting the declared
/// format only to disambiguate (a VRM is a GLB container, so a `glTF` magic
/// with a vrm hint stays vrm).
fn sniff_format(bytes: &[u8], hint: Option<&str>) -> String {
    if bytes.starts_with(GLB_MAGIC) {
        return if hint == Some("vrm") { "vrm" } else { "glb" }.to_string();
    }
    if bytes.starts_with(FBX_MAGIC) {
        return "fbx".to_string();
    }
    if bytes.starts_with(BLEND_MAGIC) {
        return "blend".to_string();
    }
    if let Some(kind) = infer::get(bytes) {
        return kind.extension().to_string();
    }
    if looks_like_gltf_json(bytes) {
        return "gltf".to_string();
    }
    if let Some(hint) = hint {
        return hint.to_string();
    }
    "unknown".to_string()
}

/// glTF's JSON form: a JSON document whose header carries an "asset" key.
fn looks_like_gltf_json(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(4096)];
    let trimmed = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|i| &head[i..])
        .unwrap_or(head);
    trimmed.starts_with(b"{") && trimmed.windows(7).any(|w| w == b"\"asset\"")
}

fn normalize_format(format: &str) -> String {
    let lower = format.trim_start_matches('.').to_ascii_lowercase();
    match lower.as_str() {
        "jpeg" => "jpg".to_string(),
        _ => lower,
    }
}

fn formats_compatible(sniffed: &str, hint: &str) -> bool {
    if sniffed == hint {
        return true;
    }
    // VRM is a GLB container; either label is consistent with the other.
    matches!((sniffed, hint), ("vrm", "glb") | ("glb", "vrm"))
}

fn conversion_note(format: &str) -> String {
    format!("{format} requires manual conversion to vrm (Blender VRM add-on or UniVRM)")
}

/// Flatten a filename or provider model id into a single safe path component.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

/// Write bytes through a sibling temp file so readers never observe a
/// partially written artifact.
fn write_atomic(dest: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

/// Extract a zip payload into `extract_dir`, returning entry names.
/// Archive-format problems are an outcome, not an error; only storage I/O
/// propagates.
fn extract_zip(bytes: &[u8], extract_dir: &Path) -> Result<ExtractOutcome, ClassifyError> {
    let mut archive = match ZipArchive::new(Cursor::new(bytes)) {
        Ok(archive) => archive,
        Err(zip::result::ZipError::Io(e)) => return Err(e.into()),
        Err(e) => return Ok(ExtractOutcome::Unreadable(e.to_string())),
    };

    fs::create_dir_all(extract_dir)?;
    let mut entries = Vec::with_capacity(archive.len());

    for index in 0..archive.len() {
        let mut file = match archive.by_index(index) {
            Ok(file) => file,
            Err(zip::result::ZipError::Io(e)) => return Err(e.into()),
            Err(e) => return Ok(ExtractOutcome::Unreadable(e.to_string())),
        };
        entries.push(file.name().to_string());

        // enclosed_name refuses entries that would escape the extraction dir
        let Some(relative) = file.enclosed_name() else {
            debug!("Skipping unsafe zip entry {}", file.name());
            continue;
        };
        let dest = extract_dir.join(relative);

        if file.is_dir() {
            fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&dest)?;
        io::copy(&mut file, &mut out)?;
    }

    Ok(ExtractOutcome::Extracted(entries))
}

/// Recursively list files under a directory.
fn collect_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Pick the primary 3D asset from extracted files: the hinted format wins,
/// then the fixed preference order.
fn select_primary(files: &[PathBuf], hint: Option<&str>) -> Option<(PathBuf, String)> {
    let mut order: Vec<&str> = Vec::with_capacity(PRIMARY_FORMATS.len() + 1);
    if let Some(hint) = hint {
        if PRIMARY_FORMATS.contains(&hint) {
            order.push(hint);
        }
    }
    order.extend(PRIMARY_FORMATS.iter().filter(|f| Some(**f) != hint));

    for format in order {
        if let Some(path) = files.iter().find(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case(format))
                .unwrap_or(false)
        }) {
            return Some((path.clone(), format.to_string()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn glb_bytes() -> Vec<u8> {
        let mut bytes = b"glTF".to_vec();
        bytes.extend_from_slice(&[2, 0, 0, 0, 64, 0, 0, 0]);
        bytes
    }

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn payload(bytes: Vec<u8>) -> Payload {
        Payload {
            bytes,
            declared_len: None,
            filename: None,
        }
    }

    #[test]
    fn test_sniff_glb_magic() {
        assert_eq!(sniff_format(&glb_bytes(), None), "glb");
        assert_eq!(sniff_format(&glb_bytes(), Some("vrm")), "vrm");
    }

    #[test]
    fn test_sniff_gltf_json() {
        let body = br#"{ "asset": { "version": "2.0" } }"#;
        assert_eq!(sniff_format(body, None), "gltf");
    }

    #[test]
    fn test_sniff_falls_back_to_hint() {
        assert_eq!(sniff_format(b"v 0 0 0", Some("obj")), "obj");
        assert_eq!(sniff_format(b"\x00\x01\x02", None), "unknown");
    }

    #[test]
    fn test_classify_direct_vrm() {
        let dir = tempdir().unwrap();
        let classifier = Classifier::new(dir.path());

        let artifact = classifier
            .classify(SourceId::VroidHub, "123", &payload(glb_bytes()), Some("vrm"))
            .unwrap();

        assert_eq!(artifact.file_type, "vrm");
        assert_eq!(artifact.original_format, None);
        assert!(artifact.file_path.starts_with("raw/vroid_hub/"));
        assert_eq!(artifact.size_bytes, glb_bytes().len() as u64);
        assert!(artifact.notes.iter().any(|n| n.starts_with("sha256:")));
        assert!(dir.path().join(&artifact.file_path).exists());
    }

    #[test]
    fn test_classify_archive_selects_primary_vrm() {
        let dir = tempdir().unwrap();
        let classifier = Classifier::new(dir.path());

        let glb = glb_bytes();
        let archive = zip_bytes(&[
            ("readme.txt", b"hello".as_slice()),
            ("models/avatar.vrm", glb.as_slice()),
        ]);

        let artifact = classifier
            .classify(SourceId::DeviantArt, "dev1", &payload(archive), Some("zip"))
            .unwrap();

        assert_eq!(artifact.file_type, "vrm");
        assert_eq!(artifact.original_format.as_deref(), Some("zip"));
        assert!(artifact.file_path.contains("extracted/deviantart/dev1"));
        assert!(artifact
            .notes
            .iter()
            .any(|n| n.contains("models/avatar.vrm")));
    }

    #[test]
    fn test_classify_archive_without_assets_falls_back() {
        let dir = tempdir().unwrap();
        let classifier = Classifier::new(dir.path());

        let archive = zip_bytes(&[
            ("readme.txt", b"docs".as_slice()),
            ("texture.txt", b"not a model".as_slice()),
        ]);

        let artifact = classifier
            .classify(SourceId::Sketchfab, "sk9", &payload(archive), None)
            .unwrap();

        // Still a successful catalog entry, pointing at the archive itself.
        assert_eq!(artifact.file_type, "zip");
        assert!(artifact
            .notes
            .iter()
            .any(|n| n.contains("archive contents")));
        assert!(artifact
            .notes
            .iter()
            .any(|n| n.contains("manual conversion required")));
    }

    #[test]
    fn test_hint_mismatch_recorded_not_fatal() {
        let dir = tempdir().unwrap();
        let classifier = Classifier::new(dir.path());

        let archive = zip_bytes(&[("scene.gltf", br#"{"asset":{}}"#.as_slice())]);
        let artifact = classifier
            .classify(SourceId::Sketchfab, "sk10", &payload(archive), Some("glb"))
            .unwrap();

        assert!(artifact
            .notes
            .iter()
            .any(|n| n.contains("declared format 'glb'")));
        assert_eq!(artifact.file_type, "gltf");
    }

    #[test]
    fn test_model_id_with_slashes_is_sanitized() {
        let dir = tempdir().unwrap();
        let classifier = Classifier::new(dir.path());

        let artifact = classifier
            .classify(
                SourceId::GitHub,
                "vrm-c/UniVRM/Models/Alicia.vrm",
                &payload(glb_bytes()),
                Some("vrm"),
            )
            .unwrap();
        assert!(!artifact.file_path.contains("UniVRM/Models"));
        assert!(dir.path().join(&artifact.file_path).exists());
    }

    #[test]
    fn test_store_thumbnail_sniffs_extension() {
        let dir = tempdir().unwrap();
        let classifier = Classifier::new(dir.path());

        let png = [
            0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 13, b'I', b'H', b'D', b'R',
        ];
        let path = classifier
            .store_thumbnail(SourceId::VroidHub, "123", &png)
            .unwrap();
        assert!(path.ends_with("123_thumb.png"));
        assert!(dir.path().join(&path).exists());
    }

    #[test]
    fn test_size_comes_from_stored_artifact() {
        let dir = tempdir().unwrap();
        let classifier = Classifier::new(dir.path());

        let mut p = payload(glb_bytes());
        p.declared_len = Some(999_999);
        let artifact = classifier
            .classify(SourceId::Sketchfab, "sz", &p, Some("glb"))
            .unwrap();
        assert_eq!(artifact.size_bytes, glb_bytes().len() as u64);
    }
}
