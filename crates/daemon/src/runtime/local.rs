//! Host process runtime used for development and tests.

use std::collections::HashSet;
use std::os::fd::BorrowedFd;

use super::{ContainerHandle, ContainerRuntime, ProcessHandle, RuntimeError, ShellProcess};

/// Runs shells directly on the host instead of inside a container.
///
/// Every reference resolves unless an allow-list is configured.
#[derive(Debug, Default, Clone)]
pub struct LocalRuntime {
    allowed: Option<HashSet<String>>,
}

impl LocalRuntime {
    /// Creates a runtime that accepts any container reference.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runtime that only resolves the given references.
    pub fn with_containers<I, S>(refs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: Some(refs.into_iter().map(Into::into).collect()),
        }
    }
}

impl ContainerRuntime for LocalRuntime {
    fn resolve(&self, container_ref: &str) -> Result<ContainerHandle, RuntimeError> {
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(container_ref) {
                return Err(RuntimeError::NotFound(container_ref.to_string()));
            }
        }
        Ok(ContainerHandle {
            reference: container_ref.to_string(),
            id: container_ref.to_string(),
        })
    }

    fn attach_interactive(
        &self,
        _handle: &ContainerHandle,
        argv: &[String],
        env: &[(String, String)],
        subordinate: BorrowedFd<'_>,
    ) -> Result<Box<dyn ProcessHandle>, RuntimeError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| RuntimeError::Unavailable("empty shell command".to_string()))?;
        let process = ShellProcess::spawn_on_pty(program, args, env, subordinate)?;
        Ok(Box::new(process))
    }

    fn propagate_size(
        &self,
        _handle: &ContainerHandle,
        _rows: u16,
        _cols: u16,
    ) -> Result<(), RuntimeError> {
        // The window-size ioctl on the controlling end already reaches a host shell.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_any_reference() {
        let runtime = LocalRuntime::new();
        let handle = runtime.resolve("c1").unwrap();
        assert_eq!(handle.reference, "c1");
        assert_eq!(handle.id, "c1");
    }

    #[test]
    fn test_allow_list_rejects_unknown() {
        let runtime = LocalRuntime::with_containers(["c1", "c2"]);
        assert!(runtime.resolve("c2").is_ok());
        assert!(matches!(
            runtime.resolve("nope"),
            Err(RuntimeError::NotFound(ref r)) if r == "nope"
        ));
    }

    #[test]
    fn test_default_container_name() {
        let runtime = LocalRuntime::new();
        assert_eq!(runtime.container_name("attacker", "lab1"), "attacker-lab1");
    }

    #[test]
    fn test_empty_argv_is_rejected() {
        let runtime = LocalRuntime::new();
        let handle = runtime.resolve("c1").unwrap();
        let pty = nix::pty::openpty(None, None).unwrap();
        let result = runtime.attach_interactive(
            &handle,
            &[],
            &[],
            std::os::fd::AsFd::as_fd(&pty.slave),
        );
        assert!(matches!(result, Err(RuntimeError::Unavailable(_))));
    }
}
