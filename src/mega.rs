//! MEGA.nz retrieval.
//!
//! The cipher side (key unfolding, attribute decrypt, streaming payload
//! decrypt) is plain byte-in byte-out code with no transport in it, so the
//! whole crypto path is exercised by fixed vectors in the tests below. The
//! transport side talks to the `cs` API and streams the encrypted payload
//! through the cipher into the output file.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::OnceLock;

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, KeyIvInit, StreamCipher};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::hosts::{self, FetchContext};
use crate::http;
use crate::runner::DownloadJob;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

const MEGA_API_BASE: &str = "https://g.api.mega.co.nz/cs";
const STREAM_CHUNK_BYTES: usize = 16 * 1024;

/// File id and key as they appear in a share link, still base64url encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MegaReference {
    pub file_id: String,
    pub file_key: String,
}

/// Accepts both the current `/file/<id>#<key>` form and the legacy
/// `/#!<id>!<key>` form; trailing query strings are ignored.
pub fn parse_reference(url: &str) -> Option<MegaReference> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"mega\.(?:nz|co\.nz)(?:/file/|/#!|/folder/)([^#!]+)[#!](.+?)(?:\?|$)").unwrap()
    });
    re.captures(url).map(|caps| MegaReference {
        file_id: caps[1].to_string(),
        file_key: caps[2].to_string(),
    })
}

fn base64_url_decode(data: &str) -> Result<Vec<u8>> {
    let mut normalized = data.replace('-', "+").replace('_', "/").replace(',', "");
    while normalized.len() % 4 != 0 {
        normalized.push('=');
    }
    BASE64
        .decode(normalized)
        .map_err(|err| EngineError::Crypto(format!("bad base64 in mega key: {err}")))
}

/// Big-endian u32 words, zero-padded on the right to a 4-byte boundary.
fn bytes_to_words(bytes: &[u8]) -> Vec<u32> {
    let mut padded = bytes.to_vec();
    while padded.len() % 4 != 0 {
        padded.push(0);
    }
    padded
        .chunks_exact(4)
        .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// The unfolded file key: an AES-128 key plus the CTR nonce, both derived
/// from the 8-word key in the share link.
#[derive(Debug)]
pub struct MegaCipher {
    key: [u8; 16],
    counter_iv: [u8; 16],
}

impl MegaCipher {
    /// Unfolds the share-link key. File keys decode to exactly 8 big-endian
    /// words; the AES key is the xor of the two halves and the CTR counter
    /// starts from words 4 and 5.
    pub fn from_link_key(file_key: &str) -> Result<Self> {
        let words = bytes_to_words(&base64_url_decode(file_key)?);
        if words.len() != 8 {
            return Err(EngineError::Crypto(format!(
                "mega file key decodes to {} words, expected 8",
                words.len()
            )));
        }

        let mut key = [0_u8; 16];
        for i in 0..4 {
            key[i * 4..i * 4 + 4].copy_from_slice(&(words[i] ^ words[i + 4]).to_be_bytes());
        }

        let mut counter_iv = [0_u8; 16];
        counter_iv[0..4].copy_from_slice(&words[4].to_be_bytes());
        counter_iv[4..8].copy_from_slice(&words[5].to_be_bytes());

        Ok(Self { key, counter_iv })
    }

    /// Decrypts the `at` attribute blob and pulls the original filename out
    /// of it. Attributes are AES-CBC with a zero IV around a `MEGA`-prefixed
    /// JSON object whose `n` member is the name.
    pub fn decrypt_attribute_name(&self, attr_b64: &str) -> Result<Option<String>> {
        let mut data = base64_url_decode(attr_b64)?;
        if data.is_empty() || data.len() % 16 != 0 {
            return Err(EngineError::Crypto(
                "mega attribute block is not a whole number of cipher blocks".to_string(),
            ));
        }

        let decryptor = Aes128CbcDec::new_from_slices(&self.key, &[0_u8; 16])
            .map_err(|err| EngineError::Crypto(format!("mega attribute cipher: {err}")))?;
        let decrypted = decryptor
            .decrypt_padded_mut::<NoPadding>(&mut data)
            .map_err(|err| EngineError::Crypto(format!("mega attribute decrypt: {err}")))?;

        let text = String::from_utf8_lossy(decrypted);
        let text = text.trim_end_matches('\0');
        if !text.starts_with("MEGA") {
            return Ok(None);
        }

        static JSON_RE: OnceLock<Regex> = OnceLock::new();
        let re = JSON_RE.get_or_init(|| Regex::new(r"\{.*\}").unwrap());
        let Some(json_part) = re.find(text) else {
            return Ok(None);
        };
        let attrs: Value = match serde_json::from_str(json_part.as_str()) {
            Ok(attrs) => attrs,
            Err(_) => return Ok(None),
        };
        Ok(attrs["n"].as_str().map(str::to_string))
    }

    /// A fresh payload decryptor positioned at byte zero.
    pub fn stream_decryptor(&self) -> Result<MegaStreamDecryptor> {
        let inner = Aes128Ctr::new_from_slices(&self.key, &self.counter_iv)
            .map_err(|err| EngineError::Crypto(format!("mega payload cipher: {err}")))?;
        Ok(MegaStreamDecryptor { inner })
    }
}

/// Keystream position carries across chunks, so feeding the payload through
/// in arbitrary slices yields the same bytes as one pass.
pub struct MegaStreamDecryptor {
    inner: Aes128Ctr,
}

impl MegaStreamDecryptor {
    pub fn decrypt_chunk(&mut self, buf: &mut [u8]) {
        self.inner.apply_keystream(buf);
    }
}

fn api_error_message(code: i64) -> String {
    let reason = match code {
        -1 => "Internal error",
        -2 => "Invalid arguments",
        -3 => "Request failed, retrying",
        -9 => "File not found",
        -11 => "Access denied",
        -14 => "Temporarily unavailable",
        -16 => "User blocked",
        -17 => "Request quota exceeded",
        -18 => "Resource unavailable",
        _ => "Unknown error",
    };
    format!("mega api error {code}: {reason}")
}

struct MegaFileInfo {
    download_url: String,
    size: u64,
    attr_b64: Option<String>,
}

/// One `g` request against the `cs` endpoint. The API answers either with a
/// bare negative integer or with an array whose first element is the file
/// record (or, again, a negative integer).
fn request_file_info(ctx: &FetchContext, file_id: &str) -> Result<MegaFileInfo> {
    let sequence = uuid::Uuid::new_v4().as_u128() as u32;
    let api_url = format!("{MEGA_API_BASE}?id={sequence}");
    let payload = serde_json::json!([{ "a": "g", "g": 1, "p": file_id }]).to_string();

    let mut response = ctx
        .api_agent
        .post(&api_url)
        .header("Content-Type", "application/json")
        .send(payload)
        .map_err(|err| EngineError::Fetch(format!("mega api: {err}")))?;
    let mut body = String::new();
    response
        .body_mut()
        .as_reader()
        .read_to_string(&mut body)
        .map_err(|err| EngineError::Fetch(format!("mega api: {err}")))?;

    let parsed: Value = serde_json::from_str(&body)?;
    if let Some(code) = parsed.as_i64() {
        return Err(EngineError::Fetch(api_error_message(code)));
    }
    let record = parsed
        .as_array()
        .and_then(|items| items.first())
        .ok_or_else(|| EngineError::Fetch("mega api returned an empty response".to_string()))?;
    if let Some(code) = record.as_i64() {
        return Err(EngineError::Fetch(api_error_message(code)));
    }

    let download_url = record["g"]
        .as_str()
        .ok_or_else(|| EngineError::Fetch("mega api response had no download url".to_string()))?
        .to_string();
    let size = record["s"]
        .as_u64()
        .ok_or_else(|| EngineError::Fetch("mega api response had no file size".to_string()))?;
    let attr_b64 = record["at"].as_str().map(str::to_string);

    Ok(MegaFileInfo {
        download_url,
        size,
        attr_b64,
    })
}

/// Downloads one file link: resolves the key, asks the API for the payload
/// URL, then streams and decrypts in one pass. The decrypted name decides
/// the extension; attribute failures fall back to the job title.
pub fn fetch(url: &str, job: &DownloadJob, ctx: &FetchContext) -> Result<PathBuf> {
    if url.contains("/folder/") {
        return Err(EngineError::Fetch(
            "mega folder links are not supported, link the files individually".to_string(),
        ));
    }
    let reference = parse_reference(url)
        .ok_or_else(|| EngineError::Fetch(format!("no file id and key in {url}")))?;
    let cipher = MegaCipher::from_link_key(&reference.file_key)?;
    let info = request_file_info(ctx, &reference.file_id)?;

    let decrypted_name = info
        .attr_b64
        .as_deref()
        .and_then(|attr| cipher.decrypt_attribute_name(attr).ok())
        .flatten();
    let ext = decrypted_name
        .as_deref()
        .and_then(|name| {
            std::path::Path::new(name)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase())
        })
        .unwrap_or_else(|| "mp3".to_string());

    let file_name = hosts::target_file_name(job, decrypted_name.as_deref(), &ext);
    std::fs::create_dir_all(&job.target_folder)?;
    let dest = crate::paths::resolve_duplicate(&job.target_folder.join(file_name));

    let mut response = http::call_get_with_headers(ctx.stream_agent, &info.download_url, &[])
        .map_err(|err| EngineError::Fetch(format!("mega payload: {err}")))?;
    let status = response.status().as_u16();
    if status >= 400 {
        return Err(EngineError::HttpStatus {
            status,
            url: info.download_url,
        });
    }

    let temp_path = http::part_path(&dest);
    let _ = std::fs::remove_file(&temp_path);
    let mut output = std::fs::File::create(&temp_path)?;
    let mut decryptor = cipher.stream_decryptor()?;
    let mut reader = response.body_mut().as_reader();
    let mut buf = [0_u8; STREAM_CHUNK_BYTES];
    let mut written: u64 = 0;

    loop {
        if ctx.control.is_cancelled() {
            let _ = output.flush();
            return Err(EngineError::Canceled);
        }
        let read = match reader.read(&mut buf) {
            Ok(read) => read,
            Err(err) => {
                drop(output);
                let _ = std::fs::remove_file(&temp_path);
                return Err(EngineError::Fetch(format!("mega body read failed: {err}")));
            }
        };
        if read == 0 {
            break;
        }
        decryptor.decrypt_chunk(&mut buf[..read]);
        if let Err(err) = output.write_all(&buf[..read]) {
            drop(output);
            let _ = std::fs::remove_file(&temp_path);
            return Err(EngineError::Io(err));
        }
        written = written.saturating_add(read as u64);
    }

    output.flush()?;
    // The payload stream is block-aligned; trim any tail past the real size.
    if written > info.size {
        output.set_len(info.size)?;
    }
    drop(output);
    std::fs::rename(&temp_path, &dest)?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    // base64url of the 32-byte key [1,2,3,4,5,6,7,8] as big-endian words.
    fn link_key_for_words(words: [u32; 8]) -> String {
        let mut bytes = Vec::new();
        for word in words {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        BASE64
            .encode(bytes)
            .replace('+', "-")
            .replace('/', "_")
            .replace('=', "")
    }

    #[test]
    fn parses_current_and_legacy_links() {
        let current = parse_reference("https://mega.nz/file/AbCd1234#KeyPart_-55").unwrap();
        assert_eq!(current.file_id, "AbCd1234");
        assert_eq!(current.file_key, "KeyPart_-55");

        let legacy = parse_reference("https://mega.co.nz/#!oldID!oldKEY").unwrap();
        assert_eq!(legacy.file_id, "oldID");
        assert_eq!(legacy.file_key, "oldKEY");

        let with_query = parse_reference("https://mega.nz/file/id99#key77?utm=1").unwrap();
        assert_eq!(with_query.file_key, "key77");

        assert!(parse_reference("https://mega.nz/").is_none());
    }

    #[test]
    fn base64url_variants_decode() {
        assert_eq!(base64_url_decode("QQ").unwrap(), b"A");
        // '-' and '_' map onto '+' and '/'.
        assert_eq!(base64_url_decode("-_8").unwrap(), vec![0xfb, 0xff]);
        assert!(base64_url_decode("!!!").is_err());
    }

    #[test]
    fn short_byte_strings_pad_to_word_boundaries() {
        assert_eq!(bytes_to_words(b"ABC"), vec![0x4142_4300]);
        assert_eq!(bytes_to_words(&[0, 0, 0, 1, 0xff]), vec![1, 0xff00_0000]);
    }

    #[test]
    fn key_unfolds_by_xor_of_halves() {
        let words = [1, 2, 3, 4, 5, 6, 7, 8];
        let cipher = MegaCipher::from_link_key(&link_key_for_words(words)).unwrap();

        let mut expected_key = [0_u8; 16];
        for i in 0..4 {
            expected_key[i * 4..i * 4 + 4]
                .copy_from_slice(&(words[i] ^ words[i + 4]).to_be_bytes());
        }
        assert_eq!(cipher.key, expected_key);

        let mut expected_iv = [0_u8; 16];
        expected_iv[0..4].copy_from_slice(&5_u32.to_be_bytes());
        expected_iv[4..8].copy_from_slice(&6_u32.to_be_bytes());
        assert_eq!(cipher.counter_iv, expected_iv);
    }

    #[test]
    fn keys_with_wrong_word_count_are_rejected() {
        let err = MegaCipher::from_link_key("QUJD").unwrap_err();
        assert!(err.to_string().contains("expected 8"));
    }

    #[test]
    fn attribute_name_round_trips_through_cbc() {
        let words = [9, 9, 9, 9, 1, 2, 3, 4];
        let cipher = MegaCipher::from_link_key(&link_key_for_words(words)).unwrap();

        let mut plaintext = b"MEGA{\"n\":\"track one.flac\"}".to_vec();
        while plaintext.len() % 16 != 0 {
            plaintext.push(0);
        }
        let len = plaintext.len();
        let encryptor = Aes128CbcEnc::new_from_slices(&cipher.key, &[0_u8; 16]).unwrap();
        let encrypted = encryptor
            .encrypt_padded_mut::<NoPadding>(&mut plaintext, len)
            .unwrap()
            .to_vec();
        let attr_b64 = BASE64.encode(encrypted).replace('+', "-").replace('/', "_");

        let name = cipher.decrypt_attribute_name(&attr_b64).unwrap();
        assert_eq!(name, Some("track one.flac".to_string()));
    }

    #[test]
    fn attributes_without_the_magic_prefix_yield_no_name() {
        let words = [1, 1, 1, 1, 2, 2, 2, 2];
        let cipher = MegaCipher::from_link_key(&link_key_for_words(words)).unwrap();

        let mut plaintext = b"GARB{\"n\":\"x\"}\0\0\0".to_vec();
        let len = plaintext.len();
        let encryptor = Aes128CbcEnc::new_from_slices(&cipher.key, &[0_u8; 16]).unwrap();
        let encrypted = encryptor
            .encrypt_padded_mut::<NoPadding>(&mut plaintext, len)
            .unwrap()
            .to_vec();
        let attr_b64 = BASE64.encode(encrypted);

        assert_eq!(cipher.decrypt_attribute_name(&attr_b64).unwrap(), None);
    }

    #[test]
    fn payload_decrypts_identically_in_one_pass_or_chunks() {
        let words = [7, 6, 5, 4, 3, 2, 1, 0];
        let cipher = MegaCipher::from_link_key(&link_key_for_words(words)).unwrap();

        let plaintext: Vec<u8> = (0..100_u8).cycle().take(4096 + 37).collect();
        let mut encrypted = plaintext.clone();
        cipher
            .stream_decryptor()
            .unwrap()
            .decrypt_chunk(&mut encrypted);
        assert_ne!(encrypted, plaintext);

        // Whole-buffer pass.
        let mut whole = encrypted.clone();
        cipher.stream_decryptor().unwrap().decrypt_chunk(&mut whole);
        assert_eq!(whole, plaintext);

        // Uneven chunks through one decryptor give the same bytes.
        let mut chunked = encrypted;
        let mut decryptor = cipher.stream_decryptor().unwrap();
        let (head, tail) = chunked.split_at_mut(1000);
        decryptor.decrypt_chunk(head);
        let (mid, rest) = tail.split_at_mut(17);
        decryptor.decrypt_chunk(mid);
        decryptor.decrypt_chunk(rest);
        assert_eq!(chunked, plaintext);
    }

    #[test]
    fn api_error_codes_map_to_reasons() {
        assert!(api_error_message(-9).contains("File not found"));
        assert!(api_error_message(-17).contains("quota"));
        assert!(api_error_message(-99).contains("Unknown error"));
    }
}
