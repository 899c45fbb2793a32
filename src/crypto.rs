//! Cryptographic helpers for the Keycard secure channel and account flows.

use cipher::{
    block_padding::{Iso7816, UnpadError},
    typenum::{U16, U32},
    BlockDecryptMut, BlockEncryptMut, Iv, IvSizeUser, Key, KeyIvInit, KeySizeUser,
};
use bytes::{Bytes, BytesMut};
use generic_array::GenericArray;
use k256::{
    ecdh::SharedSecret, elliptic_curve::sec1::ToEncodedPoint, PublicKey, SecretKey,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use sha3::Keccak256;
use unicode_normalization::UnicodeNormalization;

use crate::Result;

pub(crate) const PAIRING_TOKEN_SALT: &str = "Keycard Pairing Password Salt";
const PAIRING_TOKEN_ROUNDS: u32 = 50_000;
const BIP39_ROUNDS: u32 = 2048;

pub(crate) type PairingToken = GenericArray<u8, U32>;
pub(crate) type Cryptogram = GenericArray<u8, U32>;
pub(crate) type Challenge = GenericArray<u8, U32>;
pub(crate) type ApduMeta = GenericArray<u8, U16>;

type Encryptor = cbc::Encryptor<aes::Aes256>;
type Decryptor = cbc::Decryptor<aes::Aes256>;

/// Cipher parameters of the Keycard secure channel: AES-256 with a
/// 16-byte CBC IV that doubles as the running MAC.
pub struct KeycardScp;

impl KeySizeUser for KeycardScp {
    type KeySize = U32;
}

impl IvSizeUser for KeycardScp {
    type IvSize = U16;
}

pub(crate) type ScpKey = Key<KeycardScp>;
pub(crate) type ScpIv = Iv<KeycardScp>;

pub(crate) fn generate_ecdh_shared_secret(private: &SecretKey, public: &PublicKey) -> SharedSecret {
    k256::elliptic_curve::ecdh::diffie_hellman(private.to_nonzero_scalar(), public.as_affine())
}

/// Pairing token derived from the pairing password in accordance with the
/// Keycard specification (PBKDF2-HMAC-SHA256, 50000 rounds).
pub(crate) fn generate_pairing_token(password: &str) -> PairingToken {
    let password = password.nfkd().collect::<String>();
    let salt = PAIRING_TOKEN_SALT.nfkd().collect::<String>();

    let mut token = PairingToken::default();
    pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        salt.as_bytes(),
        PAIRING_TOKEN_ROUNDS,
        &mut token,
    );

    token
}

/// Cryptogram exchanged during the two-stage PAIR handshake:
/// SHA-256(shared_secret | challenge).
pub(crate) fn calculate_cryptogram(
    shared_secret: &PairingToken,
    challenge: &Challenge,
) -> Cryptogram {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.update(challenge);
    hasher.finalize()
}

/// Session keys per the Keycard Secure Channel specification:
/// (K(E) | K(M)) = SHA-512(shared_secret | pairing_key | challenge).
pub(crate) fn derive_session_keys(
    secret: &SharedSecret,
    pairing_key: &[u8; 32],
    challenge: &Challenge,
) -> (ScpKey, ScpKey) {
    let mut hasher = Sha512::new();
    hasher.update(secret.raw_secret_bytes());
    hasher.update(pairing_key);
    hasher.update(challenge);
    let data = hasher.finalize();

    let enc_key = ScpKey::clone_from_slice(&data[0..32]);
    let mac_key = ScpKey::clone_from_slice(&data[32..64]);

    (enc_key, mac_key)
}

/// Encrypt data with AES-256-CBC and ISO 7816 padding.
pub(crate) fn encrypt_data(data: &mut BytesMut, enc_key: &ScpKey, iv: &ScpIv) -> Bytes {
    let msg_len = prepare_padding(data);
    // The buffer is padded to a multiple of 16 bytes above.
    let encrypted = Encryptor::new(enc_key, iv)
        .encrypt_padded_mut::<Iso7816>(data, msg_len)
        .unwrap();
    Bytes::copy_from_slice(encrypted)
}

/// Decrypt ISO 7816-padded AES-256-CBC data.
pub(crate) fn decrypt_data(
    data: &mut BytesMut,
    enc_key: &ScpKey,
    iv: &ScpIv,
) -> std::result::Result<Bytes, UnpadError> {
    let decrypted = Decryptor::new(enc_key, iv).decrypt_padded_mut::<Iso7816>(data)?;
    Ok(Bytes::copy_from_slice(decrypted))
}

/// CBC-MAC over the APDU metadata and payload. The MAC is the
/// next-to-last cipher block of an encryption pass started from a zero IV
/// and becomes the next message IV.
pub(crate) fn calculate_mac(meta: &ApduMeta, data: &[u8], mac_key: &ScpKey) -> ScpIv {
    let iv = ScpIv::default();

    let mut buf = BytesMut::new();
    buf.extend_from_slice(meta.as_slice());
    buf.extend_from_slice(data);

    let msg_len = prepare_padding(&mut buf);
    let ciphertext = Encryptor::new(mac_key, &iv)
        .encrypt_padded_mut::<Iso7816>(&mut buf, msg_len)
        .unwrap();

    *ScpIv::from_slice(&ciphertext[ciphertext.len() - 32..ciphertext.len() - 16])
}

/// One-shot encryption used by INIT: the secrets are encrypted under the
/// ECDH secret of an ephemeral host key and the card's secure-channel key,
/// and the wire format is `len(pubkey) | pubkey | iv | ciphertext`.
pub(crate) fn one_shot_encrypt(
    host_public_key: &PublicKey,
    ecdh_shared_secret: &SharedSecret,
    data: &mut BytesMut,
) -> Bytes {
    let mut iv = ScpIv::default();
    rand::thread_rng().fill_bytes(&mut iv);

    let msg_len = prepare_padding(data);
    let ciphertext = Encryptor::new(ecdh_shared_secret.raw_secret_bytes(), &iv)
        .encrypt_padded_mut::<Iso7816>(data, msg_len)
        .unwrap();

    let pub_key_data = host_public_key.to_encoded_point(false);
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[pub_key_data.len() as u8]);
    buf.extend_from_slice(pub_key_data.as_bytes());
    buf.extend_from_slice(&iv);
    buf.extend_from_slice(ciphertext);

    buf.freeze()
}

/// BIP39 seed: PBKDF2-HMAC-SHA512 over the NFKD-normalized mnemonic with
/// salt `"mnemonic" | NFKD(passphrase)`, 2048 rounds, 64-byte output.
pub fn bip39_seed(mnemonic: &str, passphrase: &str) -> [u8; 64] {
    let mnemonic = mnemonic.nfkd().collect::<String>();
    let salt = format!("mnemonic{}", passphrase.nfkd().collect::<String>());

    let mut seed = [0u8; 64];
    pbkdf2_hmac::<Sha512>(
        mnemonic.as_bytes(),
        salt.as_bytes(),
        BIP39_ROUNDS,
        &mut seed,
    );
    seed
}

/// Ethereum-style address: lower 20 bytes of Keccak-256 over the 64-byte
/// body of the uncompressed public key.
pub fn address_from_public_key(public_key: &PublicKey) -> [u8; 20] {
    let point = public_key.to_encoded_point(false);
    let digest = Keccak256::digest(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest[12..]);
    address
}

/// secp256k1 public key recovered from a raw private key.
pub fn public_from_private(private_key: &[u8]) -> Result<PublicKey> {
    let secret = SecretKey::from_slice(private_key)?;
    Ok(secret.public_key())
}

// Pads the buffer to a multiple of 16 bytes, returning the message length.
fn prepare_padding(data: &mut BytesMut) -> usize {
    let len = data.len();
    data.resize(len + 16 - len % 16, 0);
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn test_ecdh() {
        let pk1 = SecretKey::random(&mut rand::thread_rng());
        let pk2 = SecretKey::random(&mut rand::thread_rng());

        let shared1 = generate_ecdh_shared_secret(&pk1, &pk2.public_key());
        let shared2 = generate_ecdh_shared_secret(&pk2, &pk1.public_key());

        assert_eq!(shared1.raw_secret_bytes(), shared2.raw_secret_bytes());
    }

    #[test]
    fn test_derive_session_keys() {
        let secret = unhex("B410E816DA313545151807E25A830201FA389913A977066AB0C6DE0E8631E400");
        let pairing_key: [u8; 32] =
            unhex("544FF0B9B0737E4BFC4ECDFCE09F522B837051BBE4FFCEC494FA420D8525670E")
                .try_into()
                .unwrap();
        let card_data = unhex(
            "1D7C033E75E10EC578AB538F69F1B02538571BA3831441F1649E3F24B5B3E3E71D7BC2D6A3D02FC8CB2FBB3FD8711BB5",
        );

        let shared = SharedSecret::from(*ScpKey::from_slice(&secret));
        let challenge = Challenge::clone_from_slice(&card_data[..32]);

        let (enc_key, mac_key) = derive_session_keys(&shared, &pairing_key, &challenge);

        assert_eq!(
            unhex("4FF496554C01BAE0A52323E3481B448C99D43982118D95C6918FE0354D224B90"),
            enc_key.to_vec()
        );
        assert_eq!(
            unhex("185811013138EA1B4FFDBBFA7343EF2DBE3E54C2C231885E867F792448AC2FE5"),
            mac_key.to_vec()
        );
    }

    #[test]
    fn test_encrypt_data() {
        let data = unhex("A8A686D0E3290459BCB36088A8FD04A76BF13283BE4B1EAE2E1248EF609F94DC");
        let enc_key = unhex("44D689AB4B18206F7EEE5439FB9A71A8A617406BA5259728D1EBC2786D24896C");
        let iv = unhex("9D3EF41EF1D221DD98A54AD5470F58F2");

        let encrypted = encrypt_data(
            &mut BytesMut::from(&data[..]),
            ScpKey::from_slice(&enc_key),
            ScpIv::from_slice(&iv),
        );

        assert_eq!(
            unhex(
                "FFB41FED5F71A2B57A6AE62D5D5ECD1C12616F6464637DD0A7A930920ACBA55867A7E12CC4F06B089AF34FF4ED4BAB08"
            ),
            encrypted.to_vec()
        );
    }

    #[test]
    fn test_decrypt_data() {
        let enc_data = unhex(
            "73B58B66372E3446E14A9F54BA59666DB432E9DD87D24F9B0525180EE52DA2106E0C70EED7CD42B5B313E4443D6AC90D",
        );
        let enc_key = unhex("D93D8E6164196D5C5B5F84F10E4B90D98F8D282ED145513ED666AA55C9871E79");
        let iv = unhex("F959B1220333046D3C47D61B1E1B891B");

        let data = decrypt_data(
            &mut BytesMut::from(&enc_data[..]),
            ScpKey::from_slice(&enc_key),
            ScpIv::from_slice(&iv),
        )
        .unwrap();

        assert_eq!(
            unhex("2E21F9F2B2C2CC9038D518A5C6B490613E7955BD19D19108B77786986B7ABFE69000"),
            data.to_vec()
        );
    }

    #[test]
    fn test_bip39_reference_vector() {
        // BIP39 reference vector for the all-"abandon" 12-word mnemonic.
        let mnemonic =
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
        let seed = bip39_seed(mnemonic, "");
        assert_eq!(
            unhex(
                "5eb00bbddcf069084889a8ab9155568165f5c453ccb85e70811aaed6f6da5fc19a5ac40b389cd370d086206dec8aa6c43daea6690f20ad3d8d48b2d2ce9e38e4"
            ),
            seed.to_vec()
        );
    }

    #[test]
    fn test_address_from_public_key() {
        // Address of the secp256k1 generator point private key 1.
        let public = public_from_private(&unhex(
            "0000000000000000000000000000000000000000000000000000000000000001",
        ))
        .unwrap();
        assert_eq!(
            unhex("7e5f4552091a69125d5dfcb7b8c2659029395bdf"),
            address_from_public_key(&public).to_vec()
        );
    }

    #[test]
    fn test_pairing_token_deterministic() {
        let token = generate_pairing_token("KeycardDefaultPairing");
        assert_eq!(token, generate_pairing_token("KeycardDefaultPairing"));
        assert_ne!(token, generate_pairing_token("other"));
    }
}
