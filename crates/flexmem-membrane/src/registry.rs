//! The backend registry.
//!
//! An ordered set of backend instances, looked up by case-insensitive
//! name. Grounded on flexmalloc's `Allocators` class: a
//! fixed-order, null-terminated table built once at startup and replayed
//! against the definitions file.

use crate::backend::Backend;
use crate::error::ConfigError;
use crate::header::BackendId;

pub struct Registry {
    backends: Vec<Box<dyn Backend>>,
}

impl Registry {
    pub fn new(backends: Vec<Box<dyn Backend>>) -> Self {
        Registry { backends }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Backend> {
        self.backends
            .iter()
            .find(|b| b.name().eq_ignore_ascii_case(name))
            .map(|b| b.as_ref())
    }

    pub fn get_by_id(&self, id: BackendId) -> Option<&dyn Backend> {
        self.backends.get(id as usize).map(|b| b.as_ref())
    }

    pub fn id_of(&self, name: &str) -> Option<BackendId> {
        self.backends
            .iter()
            .position(|b| b.name().eq_ignore_ascii_case(name))
            .map(|p| p as BackendId)
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Backend> {
        self.backends.iter().map(|b| b.as_ref())
    }

    /// Replays a definitions file against this registry.
    ///
    /// Sections begin at a line whose prefix is the literal
    /// `# Memory configuration for allocator ` followed by a name token
    /// (the unbroken run of non-whitespace characters); the next non-empty
    /// line is handed opaquely to that backend's `configure` hook.
    /// Unknown names are a fatal configuration error.
    pub fn apply_definitions(&self, text: &str) -> Result<(), ConfigError> {
        const PREFIX: &str = "# Memory configuration for allocator ";
        let mut lines = text.lines();
        while let Some(line) = lines.next() {
            let Some(rest) = line.strip_prefix(PREFIX) else {
                continue;
            };
            let name = rest.split_whitespace().next().unwrap_or("").to_string();
            if name.is_empty() {
                continue;
            }
            let backend = self
                .get(&name)
                .ok_or_else(|| ConfigError::UnknownBackend { name: name.clone() })?;
            for next in lines.by_ref() {
                let trimmed = next.trim();
                if trimmed.is_empty() {
                    continue;
                }
                backend.configure(trimmed);
                break;
            }
        }
        Ok(())
    }

    pub fn report(&self, out: &mut String) {
        for backend in &self.backends {
            backend.stats().report(backend.name(), out);
        }
    }

    /// One `#vis` header line per backend naming its capacity, the
    /// backend half of the heterogeneous-memory "visualizer" report
    /// (reproduced from `code-locations.cxx`'s
    /// `show_hmem_visualizer_stats`). The per-rule data lines that follow
    /// each header are the classifier's responsibility
    /// ([`flexmem_core::Classifier::visualizer_report`]), since only it
    /// knows which rules target which backend.
    pub fn visualizer_header(&self, out: &mut String) {
        use std::fmt::Write as _;
        for backend in &self.backends {
            let capacity = backend
                .capacity()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unlimited".to_string());
            let _ = writeln!(out, "#vis type=mem, name={}, capacity={capacity}", backend.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::capacity_pool::CapacityPoolBackend;
    use crate::backends::posix::PosixBackend;
    use crate::platform::RawAllocFns;

    fn sample_registry() -> Registry {
        Registry::new(vec![
            Box::new(PosixBackend::new(0, RawAllocFns::default())),
            Box::new(CapacityPoolBackend::new(1, "hi", RawAllocFns::default())),
        ])
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let reg = sample_registry();
        assert!(reg.get("POSIX").is_some());
        assert!(reg.get("Hi").is_some());
        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn apply_definitions_configures_named_section() {
        let reg = sample_registry();
        let defs = "# Memory configuration for allocator hi\nSize 1 MBytes\n";
        reg.apply_definitions(defs).unwrap();
        assert_eq!(reg.get("hi").unwrap().capacity(), Some(1024 * 1024));
    }

    #[test]
    fn apply_definitions_rejects_unknown_backend() {
        let reg = sample_registry();
        let defs = "# Memory configuration for allocator ghost\nSize 1 MBytes\n";
        assert!(matches!(
            reg.apply_definitions(defs),
            Err(ConfigError::UnknownBackend { .. })
        ));
    }

    #[test]
    fn visualizer_header_reports_capacity_per_backend() {
        let reg = sample_registry();
        reg.get("hi").unwrap().configure("Size 1 MBytes");
        let mut out = String::new();
        reg.visualizer_header(&mut out);
        assert!(out.contains("name=posix, capacity=unlimited"));
        assert!(out.contains(&format!("name=hi, capacity={}", 1024 * 1024)));
    }

    #[test]
    fn id_of_matches_table_position() {
        let reg = sample_registry();
        assert_eq!(reg.id_of("posix"), Some(0));
        assert_eq!(reg.id_of("hi"), Some(1));
    }
}
