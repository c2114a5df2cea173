use std::path::Path;

fn read(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => panic!("{} must be readable: {err}", path.display()),
    }
}

#[test]
fn manifests_keep_unwrap_and_expect_lints() {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let workspace_dir = match manifest_dir.parent().and_then(Path::parent) {
        Some(dir) => dir,
        None => panic!("workspace root should be two levels above package manifest dir"),
    };

    let package = read(&manifest_dir.join("Cargo.toml"));
    assert!(
        package.contains("[lints.clippy]") && package.contains("expect_used = \"warn\""),
        "expected package lints to configure clippy::expect_used as warn"
    );

    let workspace = read(&workspace_dir.join("Cargo.toml"));
    assert!(
        workspace.contains("[workspace.lints.clippy]") && workspace.contains("unwrap_used = \"deny\""),
        "expected workspace lints to deny clippy::unwrap_used"
    );
}

#[test]
fn library_sources_do_not_unwrap() {
    let src_root = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
    let mut offenders = Vec::new();
    let mut pending = vec![src_root.clone()];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => panic!("{} must be listable: {err}", dir.display()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            if path.extension().and_then(|ext| ext.to_str()) != Some("rs") {
                continue;
            }
            let source = read(&path);
            let production = source.split("#[cfg(test)]").next().unwrap_or_default();
            for (index, line) in production.lines().enumerate() {
                if line.contains(".unwrap()") {
                    offenders.push(format!("{}:{}", path.display(), index + 1));
                }
            }
        }
    }
    assert!(offenders.is_empty(), "unwrap() outside tests: {offenders:?}");
}
