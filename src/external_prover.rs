// Prover backend that shells out to a proving program
// One process per proof. The input goes to stdin as JSON with wide integers as
// decimal strings; the program prints the proof JSON on stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use alloy_primitives::U256;
use async_trait::async_trait;
use log::debug;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::prover::{wide, ProofError, ProverInput, ProvingBackend, RawProof};
use crate::utils::field_to_u256;

/// Request body written to the prover's stdin
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireInput<'a> {
    wasm_path: &'a Path,
    zkey_path: &'a Path,
    #[serde(with = "wide")]
    secret: U256,
    #[serde(with = "wide")]
    commitment: U256,
    leaf_index: usize,
    path_index: u64,
    #[serde(with = "wide::list")]
    siblings: Vec<U256>,
    #[serde(with = "wide")]
    merkle_tree_root: U256,
    merkle_tree_depth: u64,
    #[serde(with = "wide")]
    message: U256,
    #[serde(with = "wide")]
    scope: U256,
}

pub struct ExternalProver {
    program: PathBuf,
    args: Vec<String>,
    wasm_path: PathBuf,
    zkey_path: PathBuf,
}

impl ExternalProver {
    /// Check the circuit artifacts and prepare the backend
    ///
    /// The program itself is only resolved when the first proof runs.
    pub fn new(
        program: impl Into<PathBuf>,
        args: Vec<String>,
        wasm_path: impl Into<PathBuf>,
        zkey_path: impl Into<PathBuf>,
    ) -> Result<Self, ProofError> {
        let wasm_path = wasm_path.into();
        let zkey_path = zkey_path.into();

        for artifact in [&wasm_path, &zkey_path] {
            if !artifact.is_file() {
                return Err(ProofError::ProverFailure(format!(
                    "circuit artifact {} not found",
                    artifact.display()
                )));
            }
        }

        Ok(Self {
            program: program.into(),
            args,
            wasm_path,
            zkey_path,
        })
    }

    fn request_body(&self, input: &ProverInput) -> Result<Vec<u8>, ProofError> {
        let wire = WireInput {
            wasm_path: &self.wasm_path,
            zkey_path: &self.zkey_path,
            secret: field_to_u256(input.secret),
            commitment: input.commitment,
            leaf_index: input.leaf_index,
            path_index: input.path_index,
            siblings: input.siblings.clone(),
            merkle_tree_root: input.root,
            merkle_tree_depth: input.depth,
            message: input.message,
            scope: input.scope,
        };
        serde_json::to_vec(&wire)
            .map_err(|e| ProofError::ProverFailure(format!("encoding prover input: {}", e)))
    }
}

#[async_trait]
impl ProvingBackend for ExternalProver {
    async fn prove(&self, input: &ProverInput) -> Result<RawProof, ProofError> {
        let body = self.request_body(input)?;
        let failure = |what: &str, e: std::io::Error| {
            ProofError::ProverFailure(format!("{} {}: {}", what, self.program.display(), e))
        };

        debug!("running prover {}", self.program.display());
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failure("failed to start", e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&body)
                .await
                .map_err(|e| failure("failed to write input to", e))?;
            // Closing stdin signals end of input
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| failure("failed waiting for", e))?;

        if !output.status.success() {
            return Err(ProofError::ProverFailure(format!(
                "prover exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| ProofError::ProverFailure(format!("unreadable prover output: {}", e)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::prover::LazyProver;
    use ark_bn254::Fr;
    use rand::Rng;
    use std::fs;

    struct Artifacts {
        dir: PathBuf,
    }

    impl Artifacts {
        fn create() -> Self {
            let suffix: u64 = rand::thread_rng().gen();
            let dir = std::env::temp_dir().join(format!("zkvote-prover-{:016x}", suffix));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("semaphore.wasm"), b"wasm").unwrap();
            fs::write(dir.join("semaphore.zkey"), b"zkey").unwrap();
            Self { dir }
        }

        fn wasm(&self) -> PathBuf {
            self.dir.join("semaphore.wasm")
        }

        fn zkey(&self) -> PathBuf {
            self.dir.join("semaphore.zkey")
        }
    }

    impl Drop for Artifacts {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn input() -> ProverInput {
        ProverInput {
            secret: Fr::from(99u64),
            commitment: U256::from(5u64),
            leaf_index: 0,
            path_index: 0,
            siblings: vec![U256::from(6u64)],
            root: U256::from(1234u64),
            depth: 1,
            message: U256::from(2u64),
            scope: U256::from(1u64) << 128,
        }
    }

    fn shell(artifacts: &Artifacts, script: &str) -> ExternalProver {
        ExternalProver::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
            artifacts.wasm(),
            artifacts.zkey(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_parses_prover_stdout() {
        let artifacts = Artifacts::create();
        let prover = shell(
            &artifacts,
            r#"cat > /dev/null; echo '{"merkleTreeDepth": 1, "merkleTreeRoot": "1234", "nullifier": "77", "points": ["1","2","3","4","5","6","7","8"]}'"#,
        );

        let raw = prover.prove(&input()).await.unwrap();
        assert_eq!(raw.merkle_tree_root, U256::from(1234u64));
        assert_eq!(raw.nullifier, U256::from(77u64));
        assert_eq!(raw.points.len(), 8);
    }

    #[tokio::test]
    async fn test_input_uses_decimal_strings() {
        let artifacts = Artifacts::create();
        // Echo the request back in a field the parser ignores
        let prover = shell(
            &artifacts,
            r#"req=$(cat); echo "{\"merkleTreeDepth\": 1, \"merkleTreeRoot\": \"1\", \"nullifier\": \"1\", \"points\": [], \"echo\": $req}""#,
        );
        let body: serde_json::Value =
            serde_json::from_slice(&prover.request_body(&input()).unwrap()).unwrap();

        assert_eq!(body["scope"], (U256::from(1u64) << 128usize).to_string());
        assert_eq!(body["siblings"][0], "6");
        assert_eq!(body["secret"], "99");
        assert_eq!(body["merkleTreeDepth"], 1);

        // The same body survives the trip through the subprocess
        assert!(prover.prove(&input()).await.is_ok());
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let artifacts = Artifacts::create();
        let prover = shell(&artifacts, "cat > /dev/null; echo 'witness failed' >&2; exit 3");

        match prover.prove(&input()).await {
            Err(ProofError::ProverFailure(msg)) => assert!(msg.contains("witness failed")),
            other => panic!("expected ProverFailure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_prover_failure() {
        let artifacts = Artifacts::create();
        let prover = ExternalProver::new(
            artifacts.dir.join("no-such-prover"),
            vec![],
            artifacts.wasm(),
            artifacts.zkey(),
        )
        .unwrap();

        assert!(matches!(
            prover.prove(&input()).await,
            Err(ProofError::ProverFailure(_))
        ));
    }

    #[test]
    fn test_missing_artifact_rejected() {
        let artifacts = Artifacts::create();
        let result = ExternalProver::new("sh", vec![], artifacts.dir.join("missing.wasm"), artifacts.zkey());
        assert!(matches!(result, Err(ProofError::ProverFailure(_))));
    }

    #[tokio::test]
    async fn test_lazy_prover_retries_failed_init() {
        let artifacts = Artifacts::create();
        let wasm = artifacts.dir.join("late.wasm");
        let zkey = artifacts.zkey();

        let lazy = {
            let wasm = wasm.clone();
            LazyProver::new(move || {
                ExternalProver::new(
                    "sh",
                    vec![
                        "-c".to_string(),
                        r#"cat > /dev/null; echo '{"merkleTreeDepth": "1", "merkleTreeRoot": "1", "nullifier": "1", "points": []}'"#.to_string(),
                    ],
                    wasm.clone(),
                    zkey.clone(),
                )
            })
        };

        assert!(lazy.prove(&input()).await.is_err());
        assert!(!lazy.is_initialized());

        // Artifact shows up later: the next proof initializes the backend
        fs::write(&wasm, b"wasm").unwrap();
        assert!(lazy.prove(&input()).await.is_ok());
        assert!(lazy.is_initialized());
    }
}
