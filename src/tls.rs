use crate::config::TlsFiles;

use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::TlsAcceptor;

fn open(path: &Path) -> Result<StdBufReader<File>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    Ok(StdBufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let chain: Vec<Certificate> = certs(&mut open(path)?)
        .map_err(|_| anyhow!("Failed to parse certificate {:?}", path))?
        .into_iter()
        .map(Certificate)
        .collect();
    if chain.is_empty() {
        return Err(anyhow!("No certificate found in {:?}", path));
    }
    Ok(chain)
}

fn load_key(path: &Path) -> Result<PrivateKey> {
    let mut keys = pkcs8_private_keys(&mut open(path)?)
        .map_err(|_| anyhow!("Failed to parse private key {:?}", path))?;
    if keys.is_empty() {
        keys = rsa_private_keys(&mut open(path)?)
            .map_err(|_| anyhow!("Failed to parse private key {:?}", path))?;
    }
    if keys.is_empty() {
        return Err(anyhow!("No private key found in {:?}", path));
    }
    Ok(PrivateKey(keys.remove(0)))
}

/// Construit l'accepteur STARTTLS à partir d'une chaîne de certificats et d'une clé PEM.
pub fn load_acceptor(files: &TlsFiles) -> Result<TlsAcceptor> {
    let cert_chain = load_certs(&files.cert)?;
    let private_key = load_key(&files.key)?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| anyhow!("Failed to build TLS config: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use tempfile::NamedTempFile;

    fn pem_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_pkcs8_pair() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_file = pem_file(&cert.serialize_pem().unwrap());
        let key_file = pem_file(&cert.serialize_private_key_pem());

        let files = TlsFiles {
            cert: cert_file.path().to_path_buf(),
            key: key_file.path().to_path_buf(),
        };
        assert!(load_acceptor(&files).is_ok());
    }

    #[test]
    fn missing_key_is_an_error() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_file = pem_file(&cert.serialize_pem().unwrap());
        let empty = pem_file("");

        let files = TlsFiles {
            cert: cert_file.path().to_path_buf(),
            key: empty.path().to_path_buf(),
        };
        let err = load_acceptor(&files).err().unwrap();
        assert!(err.to_string().contains("No private key"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let files = TlsFiles {
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
        };
        let err = load_acceptor(&files).err().unwrap();
        assert!(err.to_string().contains("Failed to open"));
    }
}
