//! Software block cipher modes for the simulated engine

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use des::{Des, TdesEde3};
use zeroize::Zeroizing;

use crate::error::{CeError, CeResult};
use crate::job::{Direction, EngineMode};
use crate::types::{
    CipherAlg, AES_BLOCK_SIZE, AES_KEY_128, AES_KEY_192, AES_KEY_256, DES_KEY_SIZE,
    TRIPLE_DES_KEY_SIZE,
};

/// XTS data unit size in bytes
pub const XTS_DATA_UNIT: usize = 512;

/// Expanded block cipher key
pub(crate) enum BlockKey {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
    Des(Des),
    TdesEde3(TdesEde3),
}

impl BlockKey {
    pub fn new(alg: CipherAlg, key: &[u8]) -> CeResult<Self> {
        let expanded = match (alg, key.len()) {
            (CipherAlg::Aes, AES_KEY_128) => Aes128::new_from_slice(key).map(Self::Aes128),
            (CipherAlg::Aes, AES_KEY_192) => Aes192::new_from_slice(key).map(Self::Aes192),
            (CipherAlg::Aes, AES_KEY_256) => Aes256::new_from_slice(key).map(Self::Aes256),
            (CipherAlg::Des, DES_KEY_SIZE) => Des::new_from_slice(key).map(Self::Des),
            (CipherAlg::TripleDes, TRIPLE_DES_KEY_SIZE) => {
                TdesEde3::new_from_slice(key).map(Self::TdesEde3)
            }
            (alg, n) => return Err(CeError::invalid(format!("{} byte key for {:?}", n, alg))),
        };
        expanded.map_err(|_| CeError::invalid(format!("bad key for {:?}", alg)))
    }

    pub fn block_size(&self) -> usize {
        match self {
            Self::Aes128(_) | Self::Aes192(_) | Self::Aes256(_) => AES_BLOCK_SIZE,
            Self::Des(_) | Self::TdesEde3(_) => 8,
        }
    }

    /// `block` must be exactly one block long
    pub fn encrypt_block(&self, block: &mut [u8]) {
        match self {
            Self::Aes128(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            Self::Aes192(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            Self::Aes256(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            Self::Des(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            Self::TdesEde3(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
        }
    }

    /// `block` must be exactly one block long
    pub fn decrypt_block(&self, block: &mut [u8]) {
        match self {
            Self::Aes128(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            Self::Aes192(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            Self::Aes256(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            Self::Des(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            Self::TdesEde3(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
        }
    }

    fn apply(&self, dir: Direction, block: &mut [u8]) {
        match dir {
            Direction::Encrypt => self.encrypt_block(block),
            Direction::Decrypt => self.decrypt_block(block),
        }
    }
}

fn xor(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

fn require_blocks(data: &[u8], bs: usize, mode: &str) -> CeResult<()> {
    if data.len() % bs != 0 {
        return Err(CeError::invalid(format!(
            "{} length {} is not a multiple of {}",
            mode,
            data.len(),
            bs
        )));
    }
    Ok(())
}

fn ecb(key: &BlockKey, dir: Direction, data: &mut [u8]) -> CeResult<()> {
    let bs = key.block_size();
    require_blocks(data, bs, "ECB")?;
    for block in data.chunks_exact_mut(bs) {
        key.apply(dir, block);
    }
    Ok(())
}

/// Returns the last ciphertext block as the chaining IV
fn cbc(key: &BlockKey, dir: Direction, iv: &[u8], data: &mut [u8]) -> CeResult<Vec<u8>> {
    let bs = key.block_size();
    require_blocks(data, bs, "CBC")?;
    let mut chain = iv
        .get(..bs)
        .ok_or_else(|| CeError::invalid(format!("CBC IV shorter than {}", bs)))?
        .to_vec();

    for block in data.chunks_exact_mut(bs) {
        match dir {
            Direction::Encrypt => {
                xor(block, &chain);
                key.encrypt_block(block);
                chain.copy_from_slice(block);
            }
            Direction::Decrypt => {
                let ct = block.to_vec();
                key.decrypt_block(block);
                xor(block, &chain);
                chain = ct;
            }
        }
    }
    Ok(chain)
}

/// Increment the low `bits` bits of a big-endian counter block
pub(crate) fn increment_counter(counter: &mut [u8; AES_BLOCK_SIZE], bits: u32) {
    let bits = if bits == 0 || bits > 128 { 128 } else { bits };
    let mask = if bits == 128 { u128::MAX } else { (1u128 << bits) - 1 };
    let value = u128::from_be_bytes(*counter);
    let next = (value & !mask) | (value.wrapping_add(1) & mask);
    *counter = next.to_be_bytes();
}

/// Returns the counter after the last keystream block started
fn ctr(key: &BlockKey, iv: &[u8], skip: usize, bits: u32, data: &mut [u8]) -> CeResult<Vec<u8>> {
    let mut counter = [0u8; AES_BLOCK_SIZE];
    let iv = iv
        .get(..AES_BLOCK_SIZE)
        .ok_or_else(|| CeError::invalid("CTR IV shorter than one block"))?;
    counter.copy_from_slice(iv);
    for _ in 0..skip / AES_BLOCK_SIZE {
        increment_counter(&mut counter, bits);
    }

    let mut offset = skip % AES_BLOCK_SIZE;
    let mut at = 0;
    while at < data.len() {
        let mut keystream = counter;
        key.encrypt_block(&mut keystream);
        let n = (AES_BLOCK_SIZE - offset).min(data.len() - at);
        xor(&mut data[at..at + n], &keystream[offset..offset + n]);
        increment_counter(&mut counter, bits);
        at += n;
        offset = 0;
    }
    Ok(counter.to_vec())
}

/// Multiply an XTS tweak by the primitive element
fn gf_double(tweak: &mut [u8; AES_BLOCK_SIZE]) {
    let carry = tweak[15] >> 7;
    for i in (1..AES_BLOCK_SIZE).rev() {
        tweak[i] = (tweak[i] << 1) | (tweak[i - 1] >> 7);
    }
    tweak[0] = (tweak[0] << 1) ^ (0x87 * carry);
}

/// Returns the data unit number following the last unit processed
fn xts(
    data_key: &BlockKey,
    tweak_key: &BlockKey,
    dir: Direction,
    iv: &[u8],
    data: &mut [u8],
) -> CeResult<Vec<u8>> {
    require_blocks(data, AES_BLOCK_SIZE, "XTS")?;
    let mut unit_bytes = [0u8; AES_BLOCK_SIZE];
    let n = iv.len().min(AES_BLOCK_SIZE);
    unit_bytes[..n].copy_from_slice(&iv[..n]);
    let mut unit = u128::from_le_bytes(unit_bytes);

    for sector in data.chunks_mut(XTS_DATA_UNIT) {
        let mut tweak = unit.to_le_bytes();
        tweak_key.encrypt_block(&mut tweak);
        for block in sector.chunks_exact_mut(AES_BLOCK_SIZE) {
            xor(block, &tweak);
            data_key.apply(dir, block);
            xor(block, &tweak);
            gf_double(&mut tweak);
        }
        unit = unit.wrapping_add(1);
    }
    Ok(unit.to_le_bytes().to_vec())
}

/// Subsample pattern decoded from the packed engine word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pattern {
    /// Period in blocks
    pub period: usize,
    /// Processed blocks at the start of each period
    pub processed: usize,
    /// Position of block 0 inside the period
    pub offset: usize,
}

impl Pattern {
    pub fn unpack(word: u32) -> Option<Self> {
        if word & 0x1 == 0 {
            return None;
        }
        Some(Self {
            period: ((word >> 4) & 0xF) as usize + 1,
            processed: ((word >> 8) & 0xF) as usize + 1,
            offset: ((word >> 12) & 0xF) as usize,
        })
    }

    pub fn selects(&self, block: usize) -> bool {
        (block + self.offset) % self.period < self.processed
    }
}

/// Everything a mode needs besides the data
pub(crate) struct ModeParams<'a> {
    pub alg: CipherAlg,
    pub mode: EngineMode,
    pub dir: Direction,
    pub key: &'a [u8],
    pub iv: &'a [u8],
    /// Keystream bytes to skip (CTR)
    pub skip: usize,
    /// Counter width in bits (CTR)
    pub ctr_bits: u32,
}

impl ModeParams<'_> {
    /// Process `data` in place; returns the chaining IV where the mode has one
    pub fn apply(&self, data: &mut [u8]) -> CeResult<Option<Vec<u8>>> {
        if self.mode == EngineMode::Xts {
            let (k1, k2) = self.key.split_at(self.key.len() / 2);
            let data_key = BlockKey::new(self.alg, k1)?;
            let tweak_key = BlockKey::new(self.alg, k2)?;
            return xts(&data_key, &tweak_key, self.dir, self.iv, data).map(Some);
        }

        let key = BlockKey::new(self.alg, self.key)?;
        match self.mode {
            EngineMode::Ecb => ecb(&key, self.dir, data).map(|_| None),
            EngineMode::Cbc => cbc(&key, self.dir, self.iv, data).map(Some),
            EngineMode::Ctr => ctr(&key, self.iv, self.skip, self.ctr_bits, data).map(Some),
            EngineMode::Xts => Err(CeError::invalid("XTS needs a split key")),
        }
    }

    /// Process only the full blocks `pattern` selects; the rest stay clear
    ///
    /// Chaining runs over the selected blocks as one stream.
    pub fn apply_pattern(&self, pattern: &Pattern, data: &mut [u8]) -> CeResult<Option<Vec<u8>>> {
        let selected: Vec<usize> = (0..data.len() / AES_BLOCK_SIZE)
            .filter(|&b| pattern.selects(b))
            .collect();

        let mut stream = Zeroizing::new(Vec::with_capacity(selected.len() * AES_BLOCK_SIZE));
        for &b in &selected {
            stream.extend_from_slice(&data[b * AES_BLOCK_SIZE..(b + 1) * AES_BLOCK_SIZE]);
        }
        let iv = self.apply(&mut stream)?;
        for (i, &b) in selected.iter().enumerate() {
            data[b * AES_BLOCK_SIZE..(b + 1) * AES_BLOCK_SIZE]
                .copy_from_slice(&stream[i * AES_BLOCK_SIZE..(i + 1) * AES_BLOCK_SIZE]);
        }
        Ok(iv)
    }
}
