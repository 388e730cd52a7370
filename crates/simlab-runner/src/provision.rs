use crate::error::ProvisionError;
use simlab_core::{atomic_write_bytes, ServerInstance, LEVEL_NAME_KEY, SERVER_PORT_KEY, SERVER_PROPERTIES_FILE};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// World name used for the `level-name` override, chosen by task type.
pub fn world_for_task_type(task_type: &str) -> &'static str {
    match task_type {
        "cooking" | "construction" => "Superflat",
        "techtree" => "Forest",
        _ => "Forest",
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub template: PathBuf,
    pub server_root: PathBuf,
    pub count: usize,
    pub base_port: u16,
    pub world_name: Option<String>,
    pub copy_max_attempts: usize,
}

/// Creates `count` isolated instances `<server_root>/<i>` on ports
/// `base_port + i`. Stops at the first instance that fails.
pub fn provision_instances(request: &ProvisionRequest) -> Result<Vec<ServerInstance>, ProvisionError> {
    (0..request.count)
        .map(|index| provision_instance(request, index))
        .collect()
}

/// Creates instance `index`: a verified copy of the template at
/// `<server_root>/<index>` with its `server.properties` patched for port
/// `base_port + index`.
pub fn provision_instance(
    request: &ProvisionRequest,
    index: usize,
) -> Result<ServerInstance, ProvisionError> {
    if !request.template.is_dir() {
        return Err(ProvisionError::TemplateMissing(request.template.clone()));
    }
    let port = u16::try_from(request.base_port as usize + index).map_err(|_| {
        ProvisionError::PortOverflow {
            index,
            base_port: request.base_port,
        }
    })?;
    fs::create_dir_all(&request.server_root)
        .map_err(|e| ProvisionError::io(&request.server_root, e))?;
    let dir = request.server_root.join(index.to_string());
    copy_verified(&request.template, &dir, request.copy_max_attempts)?;

    let port_value = port.to_string();
    let mut overrides: Vec<(&str, &str)> = vec![(SERVER_PORT_KEY, port_value.as_str())];
    if let Some(world) = request.world_name.as_deref() {
        overrides.push((LEVEL_NAME_KEY, world));
    }
    edit_properties(&dir.join(SERVER_PROPERTIES_FILE), &overrides)?;

    info!(instance = index, port, path = %dir.display(), "provisioned server instance");
    Ok(ServerInstance {
        index,
        dir,
        port,
        session: index.to_string(),
    })
}

/// Removes `<server_root>/<i>` for `i < count`; absent directories are fine.
pub fn clean_up_instances(server_root: &Path, count: usize) -> Result<(), ProvisionError> {
    for index in 0..count {
        let dir = server_root.join(index.to_string());
        match fs::remove_dir_all(&dir) {
            Ok(()) => debug!(path = %dir.display(), "removed previous server instance"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(ProvisionError::io(dir, err)),
        }
    }
    Ok(())
}

/// Copies `src` to a fresh `dst`, verifying top-level entry names. A failed
/// verification deletes the destination and copies again.
pub fn copy_verified(src: &Path, dst: &Path, max_attempts: usize) -> Result<(), ProvisionError> {
    let attempts = max_attempts.max(1);
    let expected = top_level_names(src)?;
    for attempt in 1..=attempts {
        remove_if_exists(dst)?;
        match copy_tree(src, dst) {
            Ok(()) => {
                let copied = top_level_names(dst)?;
                if copied == expected {
                    return Ok(());
                }
                let missing: Vec<&String> = expected.difference(&copied).collect();
                warn!(
                    src = %src.display(),
                    dst = %dst.display(),
                    attempt,
                    ?missing,
                    "server copy did not verify"
                );
            }
            Err(err) => {
                warn!(src = %src.display(), dst = %dst.display(), attempt, error = %err, "server copy failed");
            }
        }
    }
    remove_if_exists(dst)?;
    Err(ProvisionError::RetriesExhausted {
        src: src.to_path_buf(),
        dst: dst.to_path_buf(),
        attempts,
    })
}

fn remove_if_exists(path: &Path) -> Result<(), ProvisionError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ProvisionError::io(path, err)),
    }
}

pub fn top_level_names(dir: &Path) -> Result<BTreeSet<String>, ProvisionError> {
    let entries = fs::read_dir(dir).map_err(|e| ProvisionError::io(dir, e))?;
    let mut names = BTreeSet::new();
    for entry in entries {
        let entry = entry.map_err(|e| ProvisionError::io(dir, e))?;
        names.insert(entry.file_name().to_string_lossy().to_string());
    }
    Ok(names)
}

/// Recursive copy; symlinks are followed and their targets copied.
pub fn copy_tree(src: &Path, dst: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src).follow_links(true) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Rewrites `key=value` lines whose key is in `overrides`. Every other line,
/// including comments and blank lines, is kept byte for byte, and each line
/// keeps its own terminator. Keys absent from the file are not appended.
pub fn edit_properties(path: &Path, overrides: &[(&str, &str)]) -> Result<(), ProvisionError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ProvisionError::ConfigMissing(path.to_path_buf()))
        }
        Err(err) => return Err(ProvisionError::io(path, err)),
    };
    let mut out = String::with_capacity(raw.len());
    for line in raw.split_inclusive('\n') {
        let (body, ending) = split_line_ending(line);
        let replacement = property_key(body).and_then(|key| {
            overrides
                .iter()
                .find(|(wanted, _)| *wanted == key)
                .map(|(wanted, value)| format!("{}={}", wanted, value))
        });
        match replacement {
            Some(new_body) => out.push_str(&new_body),
            None => out.push_str(body),
        }
        out.push_str(ending);
    }
    atomic_write_bytes(path, out.as_bytes()).map_err(|err| ProvisionError::Write {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn split_line_ending(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

fn property_key(body: &str) -> Option<&str> {
    let trimmed = body.trim_start();
    if trimmed.starts_with('#') || trimmed.starts_with('!') {
        return None;
    }
    let (key, _) = body.split_once('=')?;
    Some(key.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempDirGuard {
        path: PathBuf,
    }

    impl TempDirGuard {
        fn new(prefix: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "{}_{}_{}",
                prefix,
                std::process::id(),
                chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
            ));
            fs::create_dir_all(&path).expect("temp dir");
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    const PROPERTIES: &str = "#Minecraft server properties\r\n\
        server-port=25565\r\n\
        level-name=world\r\n\
        \r\n\
        motd=A Minecraft Server\r\n\
        server-port-range=1\r\n";

    fn make_template(root: &Path) -> PathBuf {
        let template = root.join("server_data");
        fs::create_dir_all(template.join("world").join("region")).expect("world dir");
        fs::write(template.join("world").join("region").join("r.0.0.mca"), b"region").expect("region");
        fs::write(template.join(SERVER_PROPERTIES_FILE), PROPERTIES).expect("properties");
        fs::write(template.join("server.jar"), b"jar").expect("jar");
        fs::write(template.join("ops.json"), b"[]").expect("ops");
        template
    }

    #[test]
    fn provisions_distinct_instances_with_patched_properties() {
        let root = TempDirGuard::new("simlab_provision_three");
        let template = make_template(&root.path);
        let request = ProvisionRequest {
            template: template.clone(),
            server_root: root.path.join("instances"),
            count: 3,
            base_port: 55916,
            world_name: Some(world_for_task_type("cooking").to_string()),
            copy_max_attempts: 2,
        };
        let instances = provision_instances(&request).expect("provision");
        assert_eq!(instances.len(), 3);

        let ports: BTreeSet<u16> = instances.iter().map(|i| i.port).collect();
        assert_eq!(ports, BTreeSet::from([55916, 55917, 55918]));
        let dirs: BTreeSet<&PathBuf> = instances.iter().map(|i| &i.dir).collect();
        assert_eq!(dirs.len(), 3);
        assert_eq!(instances[2].session, "2");

        let expected_names = top_level_names(&template).expect("template names");
        for instance in &instances {
            assert_eq!(top_level_names(&instance.dir).expect("names"), expected_names);
            assert!(instance.dir.join("world/region/r.0.0.mca").is_file());
            let props = fs::read_to_string(instance.properties_path()).expect("props");
            assert!(props.contains(&format!("server-port={}\r\n", instance.port)));
            assert!(props.contains("level-name=Superflat\r\n"));
            assert!(props.contains("server-port-range=1\r\n"));
            assert!(props.starts_with("#Minecraft server properties\r\n"));
        }
        // Template untouched.
        assert_eq!(
            fs::read_to_string(template.join(SERVER_PROPERTIES_FILE)).expect("template props"),
            PROPERTIES
        );
    }

    #[test]
    fn reprovisioning_replaces_stale_instance_contents() {
        let root = TempDirGuard::new("simlab_provision_stale");
        let template = make_template(&root.path);
        let stale = root.path.join("instances").join("0");
        fs::create_dir_all(&stale).expect("stale dir");
        fs::write(stale.join("leftover.log"), "old").expect("stale file");
        let request = ProvisionRequest {
            template,
            server_root: root.path.join("instances"),
            count: 1,
            base_port: 60000,
            world_name: None,
            copy_max_attempts: 1,
        };
        let instances = provision_instances(&request).expect("provision");
        assert!(!instances[0].dir.join("leftover.log").exists());
        let props = fs::read_to_string(instances[0].properties_path()).expect("props");
        assert!(props.contains("level-name=world\r\n"));
    }

    #[test]
    fn edit_properties_only_touches_requested_keys() {
        let root = TempDirGuard::new("simlab_provision_edit");
        let path = root.path.join(SERVER_PROPERTIES_FILE);
        fs::write(&path, "a=1\n# server-port=1\nserver-port = 2\nb=3").expect("props");
        edit_properties(&path, &[(SERVER_PORT_KEY, "55920"), ("missing", "x")]).expect("edit");
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "a=1\n# server-port=1\nserver-port=55920\nb=3"
        );
    }

    #[test]
    fn missing_properties_file_is_an_error() {
        let root = TempDirGuard::new("simlab_provision_missing_props");
        let err = edit_properties(&root.path.join(SERVER_PROPERTIES_FILE), &[(SERVER_PORT_KEY, "1")])
            .expect_err("missing file should fail");
        assert!(matches!(err, ProvisionError::ConfigMissing(_)));
    }

    #[test]
    fn missing_template_is_reported() {
        let root = TempDirGuard::new("simlab_provision_no_template");
        let err = provision_instances(&ProvisionRequest {
            template: root.path.join("nope"),
            server_root: root.path.join("instances"),
            count: 1,
            base_port: 55916,
            world_name: None,
            copy_max_attempts: 1,
        })
        .expect_err("missing template should fail");
        assert!(matches!(err, ProvisionError::TemplateMissing(_)));
    }

    #[test]
    fn port_overflow_is_reported() {
        let root = TempDirGuard::new("simlab_provision_overflow");
        let template = make_template(&root.path);
        let err = provision_instances(&ProvisionRequest {
            template,
            server_root: root.path.join("instances"),
            count: 2,
            base_port: u16::MAX,
            world_name: None,
            copy_max_attempts: 1,
        })
        .expect_err("second port overflows");
        assert!(matches!(err, ProvisionError::PortOverflow { index: 1, .. }));
    }

    #[test]
    fn overflowing_instance_leaves_earlier_ones_usable() {
        let root = TempDirGuard::new("simlab_provision_single");
        let request = ProvisionRequest {
            template: make_template(&root.path),
            server_root: root.path.join("instances"),
            count: 2,
            base_port: u16::MAX,
            world_name: None,
            copy_max_attempts: 1,
        };
        let first = provision_instance(&request, 0).expect("first instance");
        assert_eq!(first.port, u16::MAX);
        let err = provision_instance(&request, 1).expect_err("second port overflows");
        assert!(matches!(err, ProvisionError::PortOverflow { index: 1, .. }));
        assert!(!request.server_root.join("1").exists());
        assert!(first.properties_path().is_file());
    }

    #[cfg(unix)]
    #[test]
    fn unverifiable_copy_exhausts_retries_and_removes_destination() {
        let root = TempDirGuard::new("simlab_provision_dangling");
        let template = make_template(&root.path);
        std::os::unix::fs::symlink(root.path.join("missing_target"), template.join("dangling"))
            .expect("symlink");
        let dst = root.path.join("instances").join("0");

        let err = copy_verified(&template, &dst, 3).expect_err("dangling link never copies");
        match err {
            ProvisionError::RetriesExhausted { src, dst: failed, attempts } => {
                assert_eq!(attempts, 3);
                assert_eq!(src, template);
                assert_eq!(failed, dst);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!dst.exists());
    }

    #[test]
    fn clean_up_tolerates_absent_instances() {
        let root = TempDirGuard::new("simlab_provision_cleanup");
        fs::create_dir_all(root.path.join("1").join("world")).expect("instance 1");
        clean_up_instances(&root.path, 3).expect("cleanup");
        assert!(!root.path.join("1").exists());
        clean_up_instances(&root.path.join("never_created"), 2).expect("absent root");
    }

    #[test]
    fn world_names_follow_task_type() {
        assert_eq!(world_for_task_type("cooking"), "Superflat");
        assert_eq!(world_for_task_type("construction"), "Superflat");
        assert_eq!(world_for_task_type("techtree"), "Forest");
        assert_eq!(world_for_task_type("anything"), "Forest");
    }
}
