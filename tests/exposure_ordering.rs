//! Integration test for the parent-before-child ordering guarantee of the
//! rendered exposure plan.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use appbox::argstream::ArgStream;
use appbox::context::FilesystemMode;
use appbox::exposure::ExposurePlan;

#[test]
fn test_every_parent_precedes_its_children() {
    let tmp = tempfile::tempdir().unwrap();

    // A mix of nesting depths, inserted in a deliberately bad order
    let rel_paths = [
        "a/b/c/d",
        "a",
        "z/y",
        "a/b",
        "z",
        "a/b/c",
        "mid/depth/path",
        "mid",
    ];
    for rel in rel_paths {
        fs::create_dir_all(tmp.path().join(rel)).unwrap();
    }

    let mut plan = ExposurePlan::new();
    for rel in rel_paths {
        let mode = if rel.len() % 2 == 0 {
            FilesystemMode::ReadOnly
        } else {
            FilesystemMode::ReadWrite
        };
        assert!(plan.expose(mode, &tmp.path().join(rel)));
    }

    let mut stream = ArgStream::new();
    plan.emit_args(&mut stream);
    let args = stream.args_lossy();

    // Map each mounted path to its first position in the argument list
    let mut position: HashMap<PathBuf, usize> = HashMap::new();
    for (idx, arg) in args.iter().enumerate() {
        let path = PathBuf::from(arg);
        if path.is_absolute() {
            position.entry(path).or_insert(idx);
        }
    }

    for rel in rel_paths {
        let path = tmp.path().join(rel);
        let child_pos = position[&path];
        for ancestor in path.ancestors().skip(1) {
            if let Some(parent_pos) = position.get(ancestor) {
                assert!(
                    parent_pos < &child_pos,
                    "{} must be mounted before {}",
                    ancestor.display(),
                    path.display()
                );
            }
        }
    }
}

#[test]
fn test_visibility_follows_emitted_plan() {
    let tmp = tempfile::tempdir().unwrap();
    let shown = tmp.path().join("shown");
    let nested = shown.join("deep/inside");
    fs::create_dir_all(&nested).unwrap();

    let mut plan = ExposurePlan::new();
    plan.expose(FilesystemMode::ReadOnly, &shown);

    assert!(plan.is_visible(&nested));
    assert!(!plan.is_visible(&tmp.path().join("never-mentioned")));
}
