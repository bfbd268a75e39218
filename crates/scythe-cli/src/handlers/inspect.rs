//! Inspect command handler

use crate::{CliResult, InspectArgs};
use scythe::ModuleImage;
use std::fs;

/// Decode a module image file and render its listing
pub fn execute_inspect(args: &InspectArgs) -> CliResult<String> {
    let bytes = fs::read(&args.file)?;
    let image = ModuleImage::from_bytes(&bytes)?;
    Ok(image.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::CliError;
    use scythe::{Instruction, Method};
    use tempfile::TempDir;

    #[test]
    fn test_inspect_renders_listing() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("Foo.smod");
        let bytes = ModuleImage::new("app/Foo")
            .with_super("base/Object")
            .with_method(Method::new("run", vec![Instruction::Line(7), Instruction::Return]))
            .to_bytes()
            .unwrap();
        fs::write(&file, bytes).unwrap();

        let listing = execute_inspect(&InspectArgs { file }).unwrap();
        assert!(listing.starts_with("module app/Foo : base/Object"));
        assert!(listing.contains("method run"));
    }

    #[test]
    fn test_inspect_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("junk.smod");
        fs::write(&file, b"not a module").unwrap();
        let err = execute_inspect(&InspectArgs { file }).unwrap_err();
        assert!(matches!(err, CliError::Scythe(_)));
    }

    #[test]
    fn test_inspect_missing_file() {
        let err = execute_inspect(&InspectArgs {
            file: "/nonexistent/Foo.smod".into(),
        })
        .unwrap_err();
        assert!(matches!(err, CliError::Io(_)));
    }
}
