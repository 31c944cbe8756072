//! Pre-flight descriptor checks
//!
//! Every descriptor is checked against the engine capabilities before it
//! touches the queue. Checks never mutate anything; a rejection is logged
//! and reported as `InvalidArgument`.

use crate::error::{CeError, CeResult};
use crate::types::{
    BufSegment, CeSupport, CipherAlg, CipherMode, CipherOpReq, HashAlg, OffloadCipherOpReq,
    ShaOpReq, AES_BLOCK_SIZE, AES_KEY_128, AES_KEY_192, AES_KEY_256, DES_KEY_SIZE, MAX_BUFFERS,
    MAX_IV_SIZE, MAX_KEY_SIZE, TRIPLE_DES_KEY_SIZE,
};

fn reject(msg: String) -> CeError {
    tracing::warn!("rejecting request: {}", msg);
    CeError::InvalidArgument(msg)
}

fn check_entries(what: &str, segments: &[BufSegment]) -> CeResult<()> {
    if segments.is_empty() || segments.len() > MAX_BUFFERS {
        return Err(reject(format!(
            "{} entries {} outside 1..={}",
            what,
            segments.len(),
            MAX_BUFFERS
        )));
    }
    Ok(())
}

/// Sum segment lengths with overflow checking and compare against `data_len`
fn check_segment_sum(what: &str, segments: &[BufSegment], data_len: u32) -> CeResult<()> {
    let mut total: u32 = 0;
    for (i, seg) in segments.iter().enumerate() {
        if seg.vaddr == 0 && seg.len != 0 {
            return Err(reject(format!("null {} segment {} with length {}", what, i, seg.len)));
        }
        total = total
            .checked_add(seg.len)
            .ok_or_else(|| reject(format!("integer overflow on total {} length", what)))?;
    }
    if total != data_len {
        return Err(reject(format!(
            "total {} length {} != data_len {}",
            what, total, data_len
        )));
    }
    Ok(())
}

/// Byte offset rules shared by cipher and offload descriptors
fn check_byteoffset(
    byteoffset: u32,
    mode: CipherMode,
    src: &[BufSegment],
    data_len: u32,
) -> CeResult<()> {
    if byteoffset != 0 {
        if mode != CipherMode::AesCtr {
            return Err(reject(format!("byte offset not supported in {}", mode.name())));
        }
        if byteoffset as usize >= AES_BLOCK_SIZE {
            return Err(reject(format!("byte offset {} not below one block", byteoffset)));
        }
        src.iter().try_fold(byteoffset, |acc, seg| acc.checked_add(seg.len)).ok_or_else(|| {
            reject("integer overflow on byte offset plus source length".to_string())
        })?;
    }
    if data_len < byteoffset {
        return Err(reject(format!(
            "data_len {} less than byte offset {}",
            data_len, byteoffset
        )));
    }
    Ok(())
}

fn check_iv(ivlen: u32, mode: CipherMode) -> CeResult<()> {
    if ivlen as usize > MAX_IV_SIZE {
        return Err(reject(format!("ivlen {} exceeds {}", ivlen, MAX_IV_SIZE)));
    }
    match (mode.is_ecb(), ivlen) {
        (true, n) if n > 0 => Err(reject(format!("{} expects a zero length IV", mode.name()))),
        (false, 0) => Err(reject(format!("{} expects a non-zero length IV", mode.name()))),
        _ => Ok(()),
    }
}

fn check_cipher_key(req: &CipherOpReq, support: &CeSupport) -> CeResult<()> {
    let klen = req.encklen as usize;
    if klen > MAX_KEY_SIZE {
        return Err(reject(format!("key length {} exceeds {}", klen, MAX_KEY_SIZE)));
    }

    if klen == 0 {
        if req.enckey.iter().any(|&b| b != 0) {
            return Err(reject("non-zero key bytes with zero key length".to_string()));
        }
        if !req.op.is_no_key() && !support.hw_key {
            return Err(reject(format!(
                "{:?} without a key needs hardware key support",
                req.op
            )));
        }
        return Ok(());
    }

    let valid = match (req.alg, req.mode) {
        (CipherAlg::Aes, CipherMode::AesXts) => {
            klen == AES_KEY_128 * 2
                || klen == AES_KEY_256 * 2
                || (support.aes_key_192 && klen == AES_KEY_192 * 2)
        }
        (CipherAlg::Aes, _) => {
            klen == AES_KEY_128 || klen == AES_KEY_256 || (support.aes_key_192 && klen == AES_KEY_192)
        }
        (CipherAlg::Des, _) => klen == DES_KEY_SIZE,
        (CipherAlg::TripleDes, _) => klen == TRIPLE_DES_KEY_SIZE,
    };
    if !valid {
        return Err(reject(format!(
            "unsupported key size {} for {:?} {}",
            klen,
            req.alg,
            req.mode.name()
        )));
    }
    Ok(())
}

/// Validate a cipher descriptor
pub fn check_cipher(req: &CipherOpReq, support: &CeSupport) -> CeResult<()> {
    check_entries("src", &req.src)?;
    check_entries("dst", &req.dst)?;
    if req.data_len == 0 {
        return Err(reject("zero data length".to_string()));
    }

    let combination_ok = match req.alg {
        CipherAlg::Aes => matches!(
            req.mode,
            CipherMode::AesCbc | CipherMode::AesEcb | CipherMode::AesCtr | CipherMode::AesXts
        ),
        CipherAlg::Des | CipherAlg::TripleDes => req.mode.is_des(),
    };
    if !combination_ok {
        return Err(reject(format!(
            "unsupported combination {:?} {}",
            req.alg,
            req.mode.name()
        )));
    }
    if req.mode == CipherMode::AesXts && !support.aes_xts {
        return Err(reject("XTS is not supported".to_string()));
    }

    check_cipher_key(req, support)?;
    check_byteoffset(req.byteoffset, req.mode, &req.src, req.data_len)?;
    check_iv(req.ivlen, req.mode)?;
    check_segment_sum("dst", &req.dst, req.data_len)?;
    check_segment_sum("src", &req.src, req.data_len)?;
    Ok(())
}

/// Validate an offload cipher descriptor
pub fn check_offload(req: &OffloadCipherOpReq) -> CeResult<()> {
    check_entries("src", &req.src)?;
    check_entries("dst", &req.dst)?;
    if req.data_len == 0 {
        return Err(reject("zero data length".to_string()));
    }

    if req.alg != CipherAlg::Aes
        || !matches!(req.mode, CipherMode::AesCbc | CipherMode::AesEcb | CipherMode::AesCtr)
    {
        return Err(reject(format!(
            "offload supports AES ECB..CTR only, got {:?} {}",
            req.alg,
            req.mode.name()
        )));
    }

    let klen = req.encklen as usize;
    if klen != AES_KEY_128 && klen != AES_KEY_256 {
        return Err(reject(format!("unsupported offload key size {}", klen)));
    }
    if req.block_offset as usize >= AES_BLOCK_SIZE {
        return Err(reject(format!("block offset {} not below one block", req.block_offset)));
    }

    check_byteoffset(req.byteoffset, req.mode, &req.src, req.data_len)?;
    check_iv(req.ivlen, req.mode)?;

    if req.is_pattern_valid {
        let p = &req.pattern_info;
        if !(1..=16).contains(&p.patt_sz)
            || !(1..=p.patt_sz).contains(&p.proc_data_sz)
            || p.patt_offset >= 16
        {
            return Err(reject(format!("invalid pattern {:?}", p)));
        }
    }

    check_segment_sum("dst", &req.dst, req.data_len)?;
    check_segment_sum("src", &req.src, req.data_len)?;

    // The mapped path walks source and destination pairwise
    if req.src.len() != req.dst.len()
        || req.src.iter().zip(&req.dst).any(|(s, d)| s.len != d.len)
    {
        return Err(reject("offload src/dst segments do not pair up".to_string()));
    }
    Ok(())
}

/// Validate a hash or CMAC descriptor
pub fn check_sha(req: &ShaOpReq) -> CeResult<()> {
    check_entries("data", &req.data)?;

    if req.alg.is_hmac() {
        if req.authkey == 0 {
            return Err(reject("null HMAC key pointer".to_string()));
        }
        if req.authklen == 0 {
            return Err(reject("zero HMAC key length".to_string()));
        }
    }

    if req.alg == HashAlg::AesCmac {
        let klen = req.authklen as usize;
        if klen != AES_KEY_128 && klen != AES_KEY_256 {
            return Err(reject(format!("unsupported CMAC key length {}", klen)));
        }
        if req.authkey == 0 {
            return Err(reject("null CMAC key pointer".to_string()));
        }
    }

    check_segment_sum("data", &req.data, req.data_len)
}
