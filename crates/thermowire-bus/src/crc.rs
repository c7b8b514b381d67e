//! Dallas/Maxim CRC-8 (polynomial x^8 + x^5 + x^4 + 1)

use thermowire_core::Address;

/// Compute the 1-Wire CRC-8 over `data`
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        let mut b = byte;
        for _ in 0..8 {
            let mix = (crc ^ b) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            b >>= 1;
        }
    }
    crc
}

/// True if the address's last byte is the CRC of the first seven
pub fn address_crc_valid(address: &Address) -> bool {
    crc8(&address.rom()) == address.crc()
}

/// Build a full address from family + serial, appending the CRC
pub fn complete_address(rom: [u8; 7]) -> Address {
    let mut bytes = [0u8; 8];
    bytes[..7].copy_from_slice(&rom);
    bytes[7] = crc8(&rom);
    Address::new(bytes)
}
