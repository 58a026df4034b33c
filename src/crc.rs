//! CRC32 compatible with the STM32-F series hardware CRC unit.
//!
//! The hardware unit consumes 32-bit words MSB first with polynomial
//! 0x04C11DB3, seed 0xFFFFFFFF, no reflection and no final XOR. That is
//! exactly CRC-32/MPEG-2 over the big-endian byte serialisation of each
//! word, so the stock algorithm from the `crc` crate is fed the
//! little-endian input words byte-swapped.

use crc::{Crc, CRC_32_MPEG_2};

const STM32_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

fn crc_words(data: &[u8]) -> u32 {
    let mut digest = STM32_CRC.digest();
    for word in data.chunks_exact(4) {
        digest.update(&[word[3], word[2], word[1], word[0]]);
    }
    digest.finalize()
}

/// CRC over `data` rounded *down* to whole 32-bit words.
///
/// Inputs shorter than one word are zero-padded to 4 bytes, matching the
/// consumers that require a minimum of one word (fragment payloads,
/// firmware pages).
pub fn stm32_crc32(data: &[u8]) -> u32 {
    if data.len() < 4 {
        let mut padded = [0u8; 4];
        padded[..data.len()].copy_from_slice(data);
        return crc_words(&padded);
    }
    crc_words(&data[..data.len() & !3])
}

/// CRC over `data` zero-padded *up* to a multiple of 4 bytes.
///
/// Used for configuration digests, where the canonical record is padded
/// rather than truncated.
pub fn stm32_crc32_padded(data: &[u8]) -> u32 {
    if data.len() % 4 == 0 && !data.is_empty() {
        return crc_words(data);
    }
    let mut padded = data.to_vec();
    padded.resize((data.len() + 3).max(4) & !3, 0);
    crc_words(&padded)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The canonical default configuration header: ConfigSize=9,
    // ConfigVersion=0, LedSyncOffset=0, reserved, OfflineTimeout=900s,
    // four zero trailer bytes.
    const DEFAULT_CONFIG: [u8; 12] = [
        0x09, 0x00, 0x00, 0x00, 0x84, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    #[test]
    fn default_config_reference_vector() {
        assert_eq!(stm32_crc32(&DEFAULT_CONFIG), 0xF7C0_95CC);
        assert_eq!(stm32_crc32_padded(&DEFAULT_CONFIG), 0xF7C0_95CC);
    }

    #[test]
    fn rounds_down_to_whole_words() {
        let mut long = DEFAULT_CONFIG.to_vec();
        long.push(0xAB);
        long.push(0xCD);
        assert_eq!(stm32_crc32(&long), stm32_crc32(&DEFAULT_CONFIG));
    }

    #[test]
    fn short_input_is_zero_padded() {
        assert_eq!(stm32_crc32(&[]), stm32_crc32(&[0, 0, 0, 0]));
        assert_eq!(stm32_crc32(&[0x09]), stm32_crc32(&[0x09, 0, 0, 0]));
    }

    #[test]
    fn pad_up_differs_from_round_down() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05];
        assert_eq!(stm32_crc32(&data), stm32_crc32(&data[..4]));
        assert_eq!(
            stm32_crc32_padded(&data),
            stm32_crc32(&[0x01, 0x02, 0x03, 0x04, 0x05, 0, 0, 0])
        );
    }
}
