//! End-to-end cycles over a real git repository with scripted test output
//! and a canned AI backend.

use nightmend::ai::{AiBackend, PatchRequest};
use nightmend::dispatch::FixDispatcher;
use nightmend::learning::LearningStore;
use nightmend::orchestrator::{CycleOutcome, Orchestrator};
use nightmend::patch::AI_SENTINEL;
use nightmend::runner::{TestRun, TestRunner};
use nightmend::vcs::{self, GitVcs};
use nightmend::FixResult;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

struct ScriptedRunner {
    outputs: VecDeque<&'static str>,
}

impl ScriptedRunner {
    fn new(outputs: &[&'static str]) -> Self {
        Self {
            outputs: outputs.iter().copied().collect(),
        }
    }
}

impl TestRunner for ScriptedRunner {
    fn run(&mut self) -> FixResult<TestRun> {
        let output = self.outputs.pop_front().unwrap_or("1 passed\n").to_string();
        Ok(if output.contains("FAILED") {
            TestRun::failure(output, 5)
        } else {
            TestRun::success(output, 5)
        })
    }
}

/// Returns a canned reply and remembers which files it was asked about.
struct CannedAi {
    reply: String,
    asked: Arc<Mutex<Vec<PathBuf>>>,
}

impl AiBackend for CannedAi {
    fn suggest_patch(&self, request: &PatchRequest<'_>) -> FixResult<String> {
        self.asked.lock().unwrap().push(request.file.to_path_buf());
        Ok(self.reply.clone())
    }
}

fn init_repo(dir: &Path, files: &[(&str, &str)]) -> git2::Repository {
    let repo = git2::Repository::init(dir).unwrap();
    {
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();
    }
    for (name, content) in files {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
    vcs::stage_all(dir).unwrap();
    vcs::commit(dir, "initial").unwrap();
    repo
}

fn head_message(repo: &git2::Repository) -> String {
    repo.head()
        .unwrap()
        .peel_to_commit()
        .unwrap()
        .message()
        .unwrap_or_default()
        .to_string()
}

#[test]
fn pattern_and_ai_fixes_are_committed() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let repo = init_repo(
        root,
        &[
            ("tests/test_calc.py", "class Calc:\n    pass\n\ndef test_add():\n    Calc().add(1, 2)\n"),
            ("tests/test_div.py", "def test_div():\n    x = 1 / 0\n    assert x\n"),
        ],
    );

    let asked = Arc::new(Mutex::new(Vec::new()));
    let ai = CannedAi {
        reply: "```diff\n--- a/tests/test_div.py\n+++ b/tests/test_div.py\n@@ -1,3 +1,3 @@\n def test_div():\n-    x = 1 / 0\n+    x = 1 / 1\n     assert x\n```".to_string(),
        asked: Arc::clone(&asked),
    };

    let store_path = root.join(".nightmend").join("learned_fixes.json");
    let dispatcher = FixDispatcher::new(
        root,
        root.join("tests"),
        LearningStore::load(&store_path).unwrap(),
        Some(Box::new(ai)),
    );
    let runner = ScriptedRunner::new(&[
        "FAILED test_calc.py::test_add - AttributeError: 'Calc' object has no attribute 'add'\n\
         FAILED test_div.py::test_div - ZeroDivisionError: division by zero\n\
         ==== 2 failed in 0.02s ====\n",
        "==== 2 passed in 0.01s ====\n",
    ]);
    let mut orchestrator = Orchestrator::new(runner, GitVcs::new(root), dispatcher);

    let outcome = orchestrator.run_cycle().unwrap();
    match &outcome {
        CycleOutcome::Fixed {
            attempts,
            files_changed,
        } => {
            assert_eq!(*attempts, 2);
            assert_eq!(files_changed.len(), 2);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    assert_eq!(*asked.lock().unwrap(), vec![PathBuf::from("tests/test_div.py")]);
    assert!(fs::read_to_string(root.join("tests/test_div.py"))
        .unwrap()
        .contains("1 / 1"));

    let reloaded = LearningStore::load(&store_path).unwrap();
    assert_eq!(
        reloaded
            .lookup("ZeroDivisionError: division by zero")
            .map(|e| e.payload.as_str()),
        Some(AI_SENTINEL)
    );

    assert_eq!(head_message(&repo), "Automated test fixes");
    let tree = repo.head().unwrap().peel_to_tree().unwrap();
    assert!(tree.get_path(Path::new("tests/test_calc.py.backup")).is_err());
    let calc_blob = tree
        .get_path(Path::new("tests/test_calc.py"))
        .unwrap()
        .to_object(&repo)
        .unwrap()
        .peel_to_blob()
        .unwrap();
    assert!(String::from_utf8_lossy(calc_blob.content()).contains("def add(self, *args, **kwargs):"));
}

#[test]
fn unfixable_failure_rolls_back_earlier_fixes() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let original_calc = "class Calc:\n    pass\n";
    let repo = init_repo(
        root,
        &[
            ("test_calc.py", original_calc),
            ("test_io.py", "def test_read():\n    open('missing.txt')\n"),
        ],
    );

    let dispatcher = FixDispatcher::new(
        root,
        root,
        LearningStore::empty(root.join(".nightmend/learned_fixes.json")),
        None,
    );
    let runner = ScriptedRunner::new(&[
        "FAILED test_calc.py::test_add - AttributeError: 'Calc' object has no attribute 'add'\n\
         FAILED test_io.py::test_read - FileNotFoundError: missing.txt\n",
    ]);
    let mut orchestrator = Orchestrator::new(runner, GitVcs::new(root), dispatcher);

    let outcome = orchestrator.run_cycle().unwrap();
    assert_eq!(outcome.to_string(), "could not fix test_io.py");

    // Pattern fix was written, then undone by the rollback.
    assert_eq!(fs::read_to_string(root.join("test_calc.py")).unwrap(), original_calc);
    assert!(root.join("test_calc.py.backup").exists());
    assert_eq!(head_message(&repo), "initial");
}

#[test]
fn learned_fix_is_replayed_without_ai() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    init_repo(root, &[("test_settings.py", "RETRIES = 0\n\ndef test_retries():\n    assert RETRIES\n")]);

    let store_path = root.join(".nightmend/learned_fixes.json");
    let mut store = LearningStore::load(&store_path).unwrap();
    store
        .store(
            "assert RETRIES",
            r#"{"type": "config", "key": "RETRIES", "new_value": "3"}"#,
        )
        .unwrap();

    let asked = Arc::new(Mutex::new(Vec::new()));
    let ai = CannedAi {
        reply: String::new(),
        asked: Arc::clone(&asked),
    };
    let dispatcher = FixDispatcher::new(root, root, LearningStore::load(&store_path).unwrap(), Some(Box::new(ai)));
    let runner = ScriptedRunner::new(&[
        "FAILED test_settings.py::test_retries - assert RETRIES\n",
        "1 passed\n",
    ]);
    let mut orchestrator = Orchestrator::new(runner, GitVcs::new(root), dispatcher).with_max_retries(2);

    assert!(orchestrator.run_cycle().unwrap().is_success());
    assert!(asked.lock().unwrap().is_empty());
    assert!(fs::read_to_string(root.join("test_settings.py"))
        .unwrap()
        .starts_with("RETRIES = 3\n"));
}
