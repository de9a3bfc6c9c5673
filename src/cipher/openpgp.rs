//! C5.2 OpenPGP engine (spec §4.5.2).
//!
//! Grounded on `sequoia-openpgp`'s `Encryptor`/`LiteralWriter` streaming
//! writer and `DecryptorBuilder` + `DecryptionHelper`/`VerificationHelper`
//! reader (`examples/generate-encrypt-decrypt.rs`), and on `decrypt_key` in
//! `sq/src/sq.rs` for unlocking a passphrase-protected secret key via
//! `Key::decrypt_secret`. The host-agent path reuses the subprocess style of
//! `fetch::agent` and adds the timeout escalation spec §5 requires for any
//! external-process call.

use crate::error::{DedpasteError, KeyId, Result};
use sequoia_openpgp::cert::CertBuilder;
use sequoia_openpgp::crypto::{Password, SessionKey};
use sequoia_openpgp::packet::key::SecretKeyMaterial;
use sequoia_openpgp::packet::{PKESK, SKESK};
use sequoia_openpgp::parse::stream::{
    DecryptionHelper, DecryptorBuilder, MessageStructure, VerificationHelper,
};
use sequoia_openpgp::parse::Parse;
use sequoia_openpgp::policy::StandardPolicy;
use sequoia_openpgp::serialize::stream::{Encryptor, LiteralWriter, Message};
use sequoia_openpgp::types::SymmetricAlgorithm;
use sequoia_openpgp::{Cert, KeyHandle};
use std::io::Write;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::mpsc;
use std::time::Duration;

/// Encrypts `plaintext` to every transport-encryption-capable subkey of
/// `armored_public_key`. `recipient_label` is used only in error messages.
pub fn encrypt(plaintext: &[u8], armored_public_key: &str, recipient_label: &str) -> Result<Vec<u8>> {
    let policy = StandardPolicy::new();
    let cert = Cert::from_bytes(armored_public_key.as_bytes()).map_err(DedpasteError::OpenPgp)?;

    let recipients = cert
        .keys()
        .with_policy(&policy, None)
        .alive()
        .revoked(false)
        .for_transport_encryption();

    let mut sink = Vec::new();
    {
        let message = Message::new(&mut sink);
        let encryptor = Encryptor::for_recipients(message, recipients)
            .build()
            .map_err(|e| annotate(e, recipient_label))?;
        let mut literal_writer = LiteralWriter::new(encryptor)
            .build()
            .map_err(DedpasteError::OpenPgp)?;
        literal_writer.write_all(plaintext).map_err(|e| DedpasteError::OpenPgp(e.into()))?;
        literal_writer.finalize().map_err(DedpasteError::OpenPgp)?;
    }
    Ok(sink)
}

fn annotate(e: anyhow::Error, recipient_label: &str) -> DedpasteError {
    DedpasteError::OpenPgp(e.context(format!("building recipient set for {recipient_label}")))
}

/// In-process decrypt using a private key the caller supplies directly,
/// optionally passphrase-protected. Bounded by `crypto_timeout`: the actual
/// decryption runs on a worker thread so a misbehaving policy/backend can't
/// hang the caller past that deadline (spec §5).
pub fn decrypt_with_provided_private_key(
    armored_ciphertext: &[u8],
    armored_private_key: &str,
    passphrase: Option<&str>,
    crypto_timeout: Duration,
) -> Result<Vec<u8>> {
    let cert = Cert::from_str(armored_private_key).map_err(DedpasteError::OpenPgp)?;
    let ciphertext = armored_ciphertext.to_vec();
    let passphrase = passphrase.map(|s| s.to_string());

    run_with_timeout(crypto_timeout, move || {
        let policy = StandardPolicy::new();
        let helper = SecretKeyHelper {
            cert: &cert,
            policy: &policy,
            passphrase: passphrase.as_deref(),
            tried: Vec::new(),
        };
        let mut decryptor = DecryptorBuilder::from_bytes(&ciphertext)
            .map_err(|_| DedpasteError::WrongEnvelopeFormat)?
            .with_policy(&policy, None, helper)
            .map_err(map_decrypt_error)?;
        let mut plaintext = Vec::new();
        std::io::copy(&mut decryptor, &mut plaintext).map_err(|e| DedpasteError::OpenPgp(e.into()))?;
        Ok(plaintext)
    })
}

fn map_decrypt_error(e: anyhow::Error) -> DedpasteError {
    if let Some(helper_err) = e.downcast_ref::<HelperError>() {
        return helper_err.clone().into();
    }
    DedpasteError::OpenPgp(e)
}

#[derive(Debug, Clone)]
enum HelperError {
    BadPassphrase,
    NoMatchingKey(Vec<KeyId>),
}

impl std::fmt::Display for HelperError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
impl std::error::Error for HelperError {}

impl From<HelperError> for DedpasteError {
    fn from(e: HelperError) -> Self {
        match e {
            HelperError::BadPassphrase => DedpasteError::BadPassphrase,
            HelperError::NoMatchingKey(ids) => DedpasteError::NoMatchingKey(ids),
        }
    }
}

struct SecretKeyHelper<'a> {
    cert: &'a Cert,
    policy: &'a StandardPolicy<'a>,
    passphrase: Option<&'a str>,
    tried: Vec<KeyId>,
}

impl<'a> VerificationHelper for SecretKeyHelper<'a> {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> sequoia_openpgp::Result<Vec<Cert>> {
        // Signatures, if present, are noted but not required for success
        // (spec §4.5.2); we don't fetch certs to verify them.
        Ok(Vec::new())
    }

    fn check(&mut self, _structure: MessageStructure) -> sequoia_openpgp::Result<()> {
        Ok(())
    }
}

impl<'a> DecryptionHelper for SecretKeyHelper<'a> {
    fn decrypt(
        &mut self,
        pkesks: &[PKESK],
        _skesks: &[SKESK],
        sym_algo: Option<SymmetricAlgorithm>,
        decrypt: &mut dyn FnMut(Option<SymmetricAlgorithm>, &SessionKey) -> bool,
    ) -> sequoia_openpgp::Result<Option<Cert>> {
        let mut saw_encrypted_secret = false;
        let mut unlock_attempted_and_failed = false;

        for ka in self
            .cert
            .keys()
            .with_policy(self.policy, None)
            .secret()
            .for_transport_encryption()
        {
            let key = ka.key().clone();
            self.tried.push(KeyId {
                key_type: "openpgp".to_string(),
                id: key.keyid().to_hex(),
            });

            let unlocked = match key.secret() {
                SecretKeyMaterial::Unencrypted(_) => key,
                SecretKeyMaterial::Encrypted(_) => {
                    saw_encrypted_secret = true;
                    let Some(passphrase) = self.passphrase else {
                        continue;
                    };
                    match key.clone().decrypt_secret(&Password::from(passphrase)) {
                        Ok(unlocked) => unlocked,
                        Err(_) => {
                            unlock_attempted_and_failed = true;
                            continue;
                        }
                    }
                }
            };

            let mut pair = match unlocked.into_keypair() {
                Ok(pair) => pair,
                Err(_) => continue,
            };

            for pkesk in pkesks {
                if let Some((algo, session_key)) = pkesk.decrypt(&mut pair, sym_algo) {
                    if decrypt(algo, &session_key) {
                        return Ok(Some(self.cert.clone()));
                    }
                }
            }
        }

        if unlock_attempted_and_failed || (saw_encrypted_secret && self.passphrase.is_none()) {
            return Err(HelperError::BadPassphrase.into());
        }
        Err(HelperError::NoMatchingKey(self.tried.clone()).into())
    }
}

/// Runs `f` on a worker thread, bounded by `timeout` (spec §5 "Cryptographic
/// operation timeout"). The worker is detached, not joined, if it overruns:
/// it finishes writing to a channel nobody reads.
fn run_with_timeout<F>(timeout: Duration, f: F) -> Result<Vec<u8>>
where
    F: FnOnce() -> Result<Vec<u8>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(DedpasteError::CryptoTimeout),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(DedpasteError::OpenPgp(anyhow::anyhow!("decryption worker panicked")))
        }
    }
}

/// A ciphertext staged to disk for the host agent, removed on drop regardless
/// of how the caller's scope exits (spec's supplemented "host-agent decrypt"
/// behavior — the agent only accepts file paths, never stdin piping of
/// armored text reliably across implementations).
struct TempCiphertextFile {
    path: std::path::PathBuf,
}

impl TempCiphertextFile {
    fn create(ciphertext: &[u8]) -> Result<Self> {
        use rand::RngCore;
        let mut suffix = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut suffix);
        let path = std::env::temp_dir().join(format!("dedpaste-{}.pgp", hex::encode(suffix)));

        std::fs::write(&path, ciphertext)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }
        Ok(TempCiphertextFile { path })
    }
}

impl Drop for TempCiphertextFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Decrypts via the host's OpenPGP agent: stages the ciphertext to a
/// private-mode temp file, runs `<gpg_binary> --batch --yes --decrypt
/// <path>`, and parses stderr for the key-IDs the agent tried (spec §4.5.2,
/// §6). `crypto_timeout` bounds the subprocess; an overrun is escalated
/// SIGTERM, then SIGKILL 300ms later, matching spec §5's process-timeout
/// policy.
pub fn decrypt_via_host_agent(
    armored_ciphertext: &[u8],
    gpg_binary: &str,
    crypto_timeout: Duration,
) -> Result<Vec<u8>> {
    let staged = TempCiphertextFile::create(armored_ciphertext)?;

    let mut child = Command::new(gpg_binary)
        .args(["--batch", "--yes", "--decrypt"])
        .arg(&staged.path)
        .env("LANG", "C")
        .env("LC_ALL", "C")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|_| DedpasteError::HostAgentUnavailable)?;

    let output = wait_with_timeout(&mut child, crypto_timeout)?;
    let stderr = String::from_utf8_lossy(&output.stderr);

    if output.status.success() {
        return Ok(output.stdout);
    }

    let tried = parse_tried_key_ids(&stderr);
    if stderr.contains("decryption failed: No secret key") || !tried.is_empty() {
        return Err(DedpasteError::NoMatchingKey(tried));
    }
    if stderr.contains("Bad passphrase") {
        return Err(DedpasteError::BadPassphrase);
    }
    Err(DedpasteError::WrongEnvelopeFormat)
}

/// Waits for `child`, killing it (SIGTERM, then SIGKILL after 300ms if still
/// alive) once `timeout` elapses without an exit.
fn wait_with_timeout(
    child: &mut std::process::Child,
    timeout: Duration,
) -> Result<std::process::Output> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let Some(mut out) = child.stdout.take() {
                use std::io::Read;
                out.read_to_end(&mut stdout)?;
            }
            if let Some(mut err) = child.stderr.take() {
                use std::io::Read;
                err.read_to_end(&mut stderr)?;
            }
            return Ok(std::process::Output { status, stdout, stderr });
        }
        if std::time::Instant::now() >= deadline {
            terminate(child);
            return Err(DedpasteError::CryptoTimeout);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(unix)]
fn terminate(child: &mut std::process::Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    let _ = kill(pid, Signal::SIGTERM);
    std::thread::sleep(Duration::from_millis(300));
    if child.try_wait().ok().flatten().is_none() {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut std::process::Child) {
    let _ = child.kill();
}

/// Parses gpg's human-readable stderr for lines like `gpg: encrypted with
/// 4096-bit RSA key, ID DEADBEEFDEADBEEF, created ...` (spec §6).
fn parse_tried_key_ids(stderr: &str) -> Vec<KeyId> {
    let mut ids = Vec::new();
    for line in stderr.lines() {
        if let Some(pos) = line.find("key, ID ") {
            let rest = &line[pos + "key, ID ".len()..];
            let id = rest.split(|c: char| c == ',' || c.is_whitespace()).next().unwrap_or("");
            if !id.is_empty() {
                // The word right before "key" is the algorithm, e.g.
                // "...encrypted with 2048-bit RSA key, ID DEADBEEF...".
                let key_type = line[..pos]
                    .split_whitespace()
                    .next_back()
                    .map(str::to_string)
                    .unwrap_or_else(|| "openpgp".to_string());
                ids.push(KeyId {
                    key_type,
                    id: id.to_string(),
                });
            }
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate_cert() -> Cert {
        CertBuilder::new()
            .add_userid("Alice <alice@example.com>")
            .add_transport_encryption_subkey()
            .generate()
            .unwrap()
            .0
    }

    fn cert_to_armor(cert: &Cert, secret: bool) -> String {
        use sequoia_openpgp::armor::{Kind, Writer};
        use sequoia_openpgp::serialize::Serialize;

        let mut buf = Vec::new();
        let kind = if secret { Kind::SecretKey } else { Kind::PublicKey };
        let mut writer = Writer::new(&mut buf, kind).unwrap();
        if secret {
            cert.as_tsk().serialize(&mut writer).unwrap();
        } else {
            cert.serialize(&mut writer).unwrap();
        }
        writer.finalize().unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn roundtrips_without_passphrase() {
        let cert = generate_cert();
        let public = cert_to_armor(&cert, false);
        let private = cert_to_armor(&cert, true);

        let ciphertext = encrypt(b"hello openpgp", &public, "alice").unwrap();
        let plaintext = decrypt_with_provided_private_key(
            &ciphertext,
            &private,
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(plaintext, b"hello openpgp");
    }

    #[test]
    fn wrong_envelope_is_rejected() {
        let cert = generate_cert();
        let private = cert_to_armor(&cert, true);
        let err = decrypt_with_provided_private_key(
            b"not an openpgp message",
            &private,
            None,
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert!(matches!(err, DedpasteError::WrongEnvelopeFormat));
    }

    #[test]
    fn unrelated_private_key_is_no_matching_key() {
        let cert = generate_cert();
        let public = cert_to_armor(&cert, false);
        let ciphertext = encrypt(b"for alice only", &public, "alice").unwrap();

        let other = generate_cert();
        let other_private = cert_to_armor(&other, true);
        let err = decrypt_with_provided_private_key(
            &ciphertext,
            &other_private,
            None,
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert!(matches!(err, DedpasteError::NoMatchingKey(_)));
    }

    #[test]
    fn parses_key_id_from_gpg_stderr() {
        let stderr = "gpg: encrypted with 2048-bit RSA key, ID DEADBEEFDEADBEEF, created 2020-01-01\n\
                       \"Alice <alice@example.com>\"\n";
        let ids = parse_tried_key_ids(stderr);
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].id, "DEADBEEFDEADBEEF");
        assert_eq!(ids[0].key_type, "RSA");
    }

    #[test]
    fn no_key_ids_in_stderr_yields_empty_list() {
        assert!(parse_tried_key_ids("gpg: decryption failed: No secret key\n").is_empty());
    }
}

