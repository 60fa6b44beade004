use std::sync::Arc;

use tempfile::TempDir;

use kiln::{
    cache::{LocalBackend, TwoPhaseCacheLookup},
    config::EngineConfig,
    content::FileContentManager,
    enumerate::DirectoryFingerprinter,
    graph::{GraphSalts, PipGraph},
    mount::{Mount, MountTable},
    observe::ObservedInputProcessor,
    path::{CaseSensitivity, PathId, PathTable},
    seal::SealedDirectoryTable,
    views::FileSystemView,
};

pub mod observe;
pub mod twophase;

/// A full engine wired over a temporary directory with two mounts:
/// `{root}/src` (readable, hashable) and `{root}/out` (writable).
pub struct TestEngine {
    _dir: TempDir,
    pub root: String,
    pub config: EngineConfig,
    pub paths: Arc<PathTable>,
    pub mounts: Arc<MountTable>,
    pub graph: Arc<PipGraph>,
    pub view: Arc<FileSystemView>,
    pub content: FileContentManager,
    pub fingerprinter: Arc<DirectoryFingerprinter>,
}

impl TestEngine {
    pub fn new(config: EngineConfig) -> Self {
        let dir = TempDir::new().expect("create temporary directory");
        let root = dir.path().to_string_lossy().into_owned();
        std::fs::create_dir_all(format!("{root}/src")).expect("create src");
        std::fs::create_dir_all(format!("{root}/out")).expect("create out");
        Self::over(dir, root, config)
    }

    /// Wire a second engine instance over the same directory, simulating a
    /// fresh build of the same workspace.
    pub fn reopen(&self, config: EngineConfig) -> Self {
        let dir = TempDir::new().expect("create scratch directory");
        Self::over(dir, self.root.clone(), config)
    }

    fn over(dir: TempDir, root: String, config: EngineConfig) -> Self {
        let paths = Arc::new(PathTable::with_sensitivity(CaseSensitivity::Sensitive));
        let src = paths.intern(&format!("{root}/src")).expect("intern src");
        let out = paths.intern(&format!("{root}/out")).expect("intern out");
        let mounts = Arc::new(MountTable::new(vec![
            Mount::builder().name("Sources").root(src).build(),
            Mount::builder()
                .name("Objects")
                .root(out)
                .writable(true)
                .build(),
        ]));
        let seals = Arc::new(SealedDirectoryTable::new());
        let graph = Arc::new(PipGraph::new(
            Arc::clone(&paths),
            seals,
            GraphSalts::default(),
        ));
        let view = Arc::new(FileSystemView::new(
            Arc::clone(&graph),
            config.include_outputs_produced_before_caching,
        ));
        let content = FileContentManager::in_memory(Arc::clone(&paths), Arc::clone(&mounts));
        let fingerprinter = Arc::new(DirectoryFingerprinter::new(
            Arc::clone(&graph),
            Arc::clone(&view),
            Arc::clone(&mounts),
            &config,
            jiff::Timestamp::now(),
        ));
        Self {
            _dir: dir,
            root,
            config,
            paths,
            mounts,
            graph,
            view,
            content,
            fingerprinter,
        }
    }

    /// Absolute path string for a workspace-relative path.
    pub fn abs(&self, rel: &str) -> String {
        format!("{}/{rel}", self.root)
    }

    /// Intern a workspace-relative path.
    pub fn path(&self, rel: &str) -> PathId {
        self.paths.intern(&self.abs(rel)).expect("intern path")
    }

    /// Create a file on disk and intern its path.
    pub fn file(&self, rel: &str, content: &[u8]) -> PathId {
        let abs = self.abs(rel);
        if let Some(parent) = std::path::Path::new(&abs).parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(&abs, content).expect("write file");
        self.path(rel)
    }

    /// An observed-input processor with the given global rules.
    pub fn processor(
        &self,
        global_rules: Vec<std::sync::Arc<kiln::observe::reclassify::ReclassificationRule>>,
    ) -> ObservedInputProcessor {
        ObservedInputProcessor::new(
            Arc::clone(&self.graph),
            Arc::clone(&self.view),
            self.content.clone(),
            Arc::clone(&self.fingerprinter),
            Arc::clone(&self.mounts),
            self.config.clone(),
            global_rules,
        )
    }

    /// A two-phase driver over the given backend.
    pub fn two_phase(&self, backend: LocalBackend) -> TwoPhaseCacheLookup<LocalBackend> {
        TwoPhaseCacheLookup::new(
            backend,
            self.processor(Vec::new()),
            Arc::clone(&self.graph),
            self.config.clone(),
            None,
        )
    }
}
