//! Hardhat compilation artifacts.

use std::path::{Path, PathBuf};

use alloy_core::primitives::Bytes;
use serde::Deserialize;
use serde_json::Value;

/// A compiled contract as written by Hardhat under `artifacts/`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub contract_name: String,
    pub source_name: String,
    pub bytecode: Bytes,
    #[serde(skip)]
    pub path: PathBuf,
}

/// The `.dbg.json` file next to each artifact, pointing at its build info.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DebugFile {
    build_info: String,
}

/// The compiler input and version a contract was built with.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub solc_long_version: String,
    /// Standard JSON input given to solc.
    pub input: Value,
}

impl Artifact {
    /// Load an artifact JSON file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let mut artifact: Self = serde_json::from_str(&content)
            .map_err(|e| format!("failed to parse {}: {}", path.display(), e))?;

        if artifact.bytecode.is_empty() {
            return Err(format!(
                "{} has no bytecode (abstract contract or interface?)",
                path.display()
            ));
        }

        artifact.path = path.to_path_buf();
        Ok(artifact)
    }

    /// Creation code followed by the encoded constructor arguments.
    pub fn creation_code(&self, encoded_args: &[u8]) -> Bytes {
        let mut code = self.bytecode.to_vec();
        code.extend_from_slice(encoded_args);
        Bytes::from(code)
    }

    /// Fully qualified name, e.g. `contracts/VetoPluginSetup.sol:VetoPluginSetup`.
    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.source_name, self.contract_name)
    }

    /// Load the build info referenced by the artifact's `.dbg.json` file.
    pub fn build_info(&self) -> Result<BuildInfo, String> {
        let dbg_path = self.path.with_extension("dbg.json");
        let content = std::fs::read_to_string(&dbg_path)
            .map_err(|e| format!("failed to read {}: {}", dbg_path.display(), e))?;
        let dbg: DebugFile = serde_json::from_str(&content)
            .map_err(|e| format!("failed to parse {}: {}", dbg_path.display(), e))?;

        let base = self.path.parent().unwrap_or_else(|| Path::new("."));
        let build_info_path = base.join(&dbg.build_info);
        let content = std::fs::read_to_string(&build_info_path)
            .map_err(|e| format!("failed to read {}: {}", build_info_path.display(), e))?;

        serde_json::from_str(&content)
            .map_err(|e| format!("failed to parse {}: {}", build_info_path.display(), e))
    }
}
