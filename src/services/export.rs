use super::PipelineError;
use crate::database::models::{ImageRecord, Project, SelectionChoice, TargetGroup};
use crate::database::{DatabaseError, Store};
use crate::workers::ProgressTracker;
use image::{ImageBuffer, Rgb};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const PLACEHOLDER_GRAY: [u8; 3] = [128, 128, 128];

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write placeholder: {0}")]
    Placeholder(#[from] image::ImageError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportOptions {
    /// Defaults to `<source parent>/<project name>_Output`.
    pub output_dir: Option<PathBuf>,
    pub use_placeholder: bool,
    pub only_confirmed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub output_dir: PathBuf,
    pub copied: usize,
    pub placeholders: usize,
    pub failed: usize,
}

pub fn default_output_dir(project: &Project) -> PathBuf {
    let source = Path::new(&project.source_path);
    source
        .parent()
        .unwrap_or(source)
        .join(format!("{}_Output", project.name))
}

/// Copies each source's selected target files into an output tree that
/// mirrors the source layout.
pub struct ExportService {
    store: Arc<dyn Store>,
}

impl ExportService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn export_project(
        &self,
        project_id: &str,
        options: &ExportOptions,
        token: &CancellationToken,
        progress: &ProgressTracker,
    ) -> Result<ExportSummary, PipelineError> {
        let project = self.store.get_project(project_id)?;
        let output_dir = options
            .output_dir
            .clone()
            .unwrap_or_else(|| default_output_dir(&project));
        fs::create_dir_all(&output_dir)?;

        let groups = self.store.target_groups(project_id)?;
        let mut sources = self.store.source_records(project_id, None)?;
        if options.only_confirmed {
            let mut confirmed = Vec::with_capacity(sources.len());
            for source in sources {
                if self.store.is_confirmed(&source.id)? {
                    confirmed.push(source);
                }
            }
            sources = confirmed;
        }

        log::info!(
            "Exporting {} sources of {} to {}",
            sources.len(),
            project.name,
            output_dir.display()
        );
        progress.reset(sources.len(), "Exporting");

        let mut summary = ExportSummary {
            output_dir: output_dir.clone(),
            ..ExportSummary::default()
        };

        for source in &sources {
            if token.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            match self.export_source(source, &groups, &output_dir, options.use_placeholder) {
                Ok((copied, placeholders)) => {
                    summary.copied += copied;
                    summary.placeholders += placeholders;
                }
                Err(e) => {
                    log::error!("Failed to export {}: {}", source.relative_path, e);
                    summary.failed += 1;
                }
            }
            progress.advance(&source.relative_path);
        }

        log::info!(
            "Export finished: {} copied, {} placeholders, {} failed",
            summary.copied,
            summary.placeholders,
            summary.failed
        );
        Ok(summary)
    }

    fn export_source(
        &self,
        source: &ImageRecord,
        groups: &[TargetGroup],
        output_dir: &Path,
        use_placeholder: bool,
    ) -> Result<(usize, usize), ExportError> {
        let relative = Path::new(&source.relative_path);
        let target_dir = match relative.parent() {
            Some(parent) => output_dir.join(parent),
            None => output_dir.to_path_buf(),
        };
        let stem = relative
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| source.relative_path.clone());

        let mut copied = 0;
        let mut placeholders = 0;

        for group in groups {
            let Some(selection) = self.store.selection(&source.id, &group.id)? else {
                continue;
            };

            match selection.choice {
                SelectionChoice::Candidate(candidate_id) => {
                    let candidate = self.store.candidate(&candidate_id)?;
                    let extension = Path::new(&candidate.file_path)
                        .extension()
                        .map(|ext| format!(".{}", ext.to_string_lossy()))
                        .unwrap_or_default();

                    fs::create_dir_all(&target_dir)?;
                    let destination =
                        target_dir.join(format!("{}_{}{}", stem, group.name, extension));
                    fs::copy(&candidate.file_path, &destination)?;
                    copied += 1;
                }
                SelectionChoice::NoMatch if use_placeholder => {
                    fs::create_dir_all(&target_dir)?;
                    let destination = target_dir.join(format!("{}_{}.png", stem, group.name));
                    write_placeholder(&destination, source.width, source.height)?;
                    placeholders += 1;
                }
                SelectionChoice::NoMatch => {}
            }
        }

        Ok((copied, placeholders))
    }
}

/// Solid gray PNG of the given size.
fn write_placeholder(path: &Path, width: u32, height: u32) -> Result<(), image::ImageError> {
    ImageBuffer::from_pixel(width.max(1), height.max(1), Rgb(PLACEHOLDER_GRAY)).save(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fingerprint::Fingerprint;
    use crate::database::models::{
        NewCandidate, NewImageRecord, NewTargetGroup, SelectionOrigin,
    };
    use crate::database::MemoryStore;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        output: PathBuf,
        store: Arc<MemoryStore>,
        project_id: String,
        sources: Vec<ImageRecord>,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let target_file = temp_dir.path().join("edited").join("match.jpg");
        fs::create_dir_all(target_file.parent().unwrap()).unwrap();
        fs::write(&target_file, b"jpeg bytes").unwrap();

        let store = Arc::new(MemoryStore::new());
        let source_root = temp_dir.path().join("shoot");
        let project = store
            .create_project(
                "shoot",
                &source_root.to_string_lossy(),
                &[NewTargetGroup {
                    name: "edited".to_string(),
                    path: temp_dir.path().join("edited").to_string_lossy().to_string(),
                }],
            )
            .unwrap();
        let group = store.target_groups(&project.id).unwrap().remove(0);

        let record = |name: &str| NewImageRecord {
            relative_path: name.to_string(),
            absolute_path: source_root.join(name).to_string_lossy().to_string(),
            width: 6,
            height: 4,
            size_bytes: 10,
            fingerprint: Fingerprint {
                perceptual_hash: 0,
                width: 6,
                height: 4,
                color_histogram: None,
            },
        };
        store
            .insert_source_records(&project.id, &[record("day1/a.png"), record("b.png")])
            .unwrap();
        // ordered by path: b.png, day1/a.png
        let sources = store.source_records(&project.id, None).unwrap();

        store
            .insert_candidates(&[NewCandidate {
                source_id: sources[0].id.clone(),
                group_id: group.id.clone(),
                file_path: target_file.to_string_lossy().to_string(),
                similarity_score: 97.0,
                rank: 1,
                width: 6,
                height: 4,
            }])
            .unwrap();
        let candidate = store.candidates_for(&sources[0].id, &group.id).unwrap().remove(0);
        store
            .upsert_selection(
                &sources[0].id,
                &group.id,
                SelectionChoice::Candidate(candidate.id),
                SelectionOrigin::Auto,
            )
            .unwrap();
        store
            .upsert_selection(
                &sources[1].id,
                &group.id,
                SelectionChoice::NoMatch,
                SelectionOrigin::User,
            )
            .unwrap();

        Fixture {
            output: temp_dir.path().join("out"),
            _temp_dir: temp_dir,
            store,
            project_id: project.id,
            sources,
        }
    }

    fn run(fixture: &Fixture, options: ExportOptions) -> ExportSummary {
        ExportService::new(fixture.store.clone())
            .export_project(
                &fixture.project_id,
                &options,
                &CancellationToken::new(),
                &ProgressTracker::new(),
            )
            .unwrap()
    }

    #[test]
    fn test_copies_selected_targets_with_group_suffix() {
        let fixture = fixture();
        let summary = run(
            &fixture,
            ExportOptions {
                output_dir: Some(fixture.output.clone()),
                ..ExportOptions::default()
            },
        );

        assert_eq!(summary.copied, 1);
        assert_eq!(summary.placeholders, 0);
        let copied = fixture.output.join("b_edited.jpg");
        assert_eq!(fs::read(copied).unwrap(), b"jpeg bytes");
        assert!(!fixture.output.join("day1").join("a_edited.png").exists());
    }

    #[test]
    fn test_placeholder_for_no_match() {
        let fixture = fixture();
        let summary = run(
            &fixture,
            ExportOptions {
                output_dir: Some(fixture.output.clone()),
                use_placeholder: true,
                only_confirmed: false,
            },
        );

        assert_eq!(summary.placeholders, 1);
        let placeholder = fixture.output.join("day1").join("a_edited.png");
        assert_eq!(image::image_dimensions(&placeholder).unwrap(), (6, 4));
    }

    #[test]
    fn test_only_confirmed_sources() {
        let fixture = fixture();
        fixture.store.set_confirmed(&fixture.sources[1].id, true).unwrap();

        let summary = run(
            &fixture,
            ExportOptions {
                output_dir: Some(fixture.output.clone()),
                use_placeholder: true,
                only_confirmed: true,
            },
        );
        assert_eq!(summary.copied, 0);
        assert_eq!(summary.placeholders, 1);
    }

    #[test]
    fn test_default_output_dir_sits_next_to_source() {
        let fixture = fixture();
        let project = fixture.store.get_project(&fixture.project_id).unwrap();
        let expected = Path::new(&project.source_path)
            .parent()
            .unwrap()
            .join("shoot_Output");
        assert_eq!(default_output_dir(&project), expected);
    }

    #[test]
    fn test_cancelled_export_stops() {
        let fixture = fixture();
        let token = CancellationToken::new();
        token.cancel();

        let result = ExportService::new(fixture.store.clone()).export_project(
            &fixture.project_id,
            &ExportOptions {
                output_dir: Some(fixture.output.clone()),
                ..ExportOptions::default()
            },
            &token,
            &ProgressTracker::new(),
        );
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}
