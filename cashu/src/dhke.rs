//! Blind Diffie-Hellman Key Exchange primitives (blind ecash).
//!
//! Implementation of [RubenSomsen/Blind-DH-ecash.md](https://gist.github.com/RubenSomsen/be7a4760dd4596d06963d67baf140406)
//!
//! Bob (Mint):
//!```python
//! A = a*G
//! return A
//! ```
//!
//! Alice (Client):
//!```python
//! Y = hash_to_curve(secret_message)
//! r = random blinding factor
//! B'= Y + r*G
//! return B'
//! ```
//!
//! Bob:
//!```python
//! C' = a*B'
//! (= a*Y + a*r*G)
//! return C'
//!```
//!
//! Alice:
//!```python
//! C = C' - r*A
//! (= C' - a*r*G)
//! (= a*Y)
//! return C, secret_message
//!```
//!
//! Used by the mint-client layer to blind outgoing secrets and unblind the
//! signatures a mint returns from a swap/receive call.

use crate::error::CashuError;
use bitcoin_hashes::{sha256, Hash};
use secp256k1::{All, PublicKey, Scalar, Secp256k1, SecretKey};
use std::iter::once;

#[derive(Clone, Debug)]
pub struct Dhke {
    secp: Secp256k1<All>,
}

impl Default for Dhke {
    fn default() -> Self {
        Self::new()
    }
}

impl Dhke {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }

    fn get_hash(message: &[u8]) -> Vec<u8> {
        let hash = sha256::Hash::hash(message);
        hash.as_byte_array().to_vec()
    }

    /// Generates a point from the message hash and checks if the point lies on the curve.
    /// If it does not, iteratively tries to compute a new point from the hash.
    fn hash_to_curve(message: &[u8]) -> PublicKey {
        let mut point: Option<PublicKey> = None;
        let mut msg_to_hash = message.to_vec();
        while point.is_none() {
            let hash = Self::get_hash(&msg_to_hash);
            let input = &once(&0x02).chain(hash.iter()).cloned().collect::<Vec<u8>>();
            PublicKey::from_slice(input).map_or_else(|_| msg_to_hash = hash, |p| point = Some(p))
        }
        point.unwrap()
    }

    pub fn step1_alice(
        &self,
        secret_msg: impl Into<String>,
        blinding_factor: Option<&[u8]>,
    ) -> Result<(PublicKey, SecretKey), CashuError> {
        let mut rng = rand::thread_rng();

        let y = Self::hash_to_curve(secret_msg.into().as_bytes());
        let secret_key = match blinding_factor {
            Some(f) => SecretKey::from_slice(f)?,
            None => SecretKey::new(&mut rng),
        };
        let b = y.combine(&PublicKey::from_secret_key(&self.secp, &secret_key))?;
        Ok((b, secret_key))
    }

    pub fn step3_alice(
        &self,
        c_: PublicKey,
        r: SecretKey,
        a: PublicKey,
    ) -> Result<PublicKey, CashuError> {
        c_.combine(
            &a.mul_tweak(&self.secp, &Scalar::from(r))
                .map_err(CashuError::Secp256k1Error)?
                .negate(&self.secp),
        )
        .map_err(CashuError::Secp256k1Error)
    }

    pub fn verify(
        &self,
        a: SecretKey,
        c: PublicKey,
        secret_msg: impl Into<String>,
    ) -> Result<bool, CashuError> {
        let y = Self::hash_to_curve(secret_msg.into().as_bytes());
        Ok(c == y.mul_tweak(&self.secp, &Scalar::from(a))?)
    }
}

pub fn public_key_from_hex(hex: &str) -> Result<secp256k1::PublicKey, CashuError> {
    use hex::FromHex;
    let input_vec: Vec<u8> = Vec::from_hex(hex).map_err(|_| CashuError::InvalidToken)?;
    Ok(secp256k1::PublicKey::from_slice(&input_vec)?)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use crate::dhke::{public_key_from_hex, Dhke};
    use pretty_assertions::assert_eq;

    fn hex_to_string(hex: &str) -> String {
        use hex::FromHex;
        let input_vec: Vec<u8> = Vec::from_hex(hex).expect("Invalid Hex String");
        String::from_utf8(input_vec).expect("Invalid UTF-8 String")
    }

    fn pk_from_hex(hex: &str) -> secp256k1::SecretKey {
        secp256k1::SecretKey::from_str(hex).expect("Invalid SecretKey")
    }

    #[test]
    fn test_hash_to_curve_zero() {
        let input_str =
            hex_to_string("0000000000000000000000000000000000000000000000000000000000000000");
        let expected_result = "0266687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925";
        let pk = Dhke::hash_to_curve(input_str.as_bytes()).to_string();
        assert_eq!(pk, expected_result);
    }

    #[test]
    fn test_step1_alice() -> anyhow::Result<()> {
        let dhke = Dhke::new();
        let blinding_factor =
            hex_to_string("0000000000000000000000000000000000000000000000000000000000000001");
        let (pub_key, secret_key) =
            dhke.step1_alice("test_message", Some(blinding_factor.as_bytes()))?;
        assert_eq!(
            pub_key.to_string(),
            "02a9acc1e48c25eeeb9289b5031cc57da9fe72f3fe2861d264bdc074209b107ba2"
        );
        assert_eq!(
            hex::encode(secret_key.secret_bytes()),
            "0000000000000000000000000000000000000000000000000000000000000001"
        );
        Ok(())
    }

    #[test]
    #[allow(non_snake_case)]
    fn test_verify_round_trip() -> anyhow::Result<()> {
        let dhke = Dhke::new();
        let a = pk_from_hex("0000000000000000000000000000000000000000000000000000000000000001");
        let A = a.public_key(&dhke.secp);

        let blinding_factor =
            hex_to_string("0000000000000000000000000000000000000000000000000000000000000002");
        let secret_msg = "test";
        let (b_, r) = dhke.step1_alice(secret_msg, Some(blinding_factor.as_bytes()))?;
        // mint side: C' = a*B'
        let c_ = b_.mul_tweak(&dhke.secp, &secp256k1::Scalar::from(a))?;
        let c = dhke.step3_alice(c_, r, A)?;

        assert!(dhke.verify(a, c, secret_msg)?);
        assert!(!dhke.verify(a, c.combine(&c)?, secret_msg)?);
        assert!(!dhke.verify(a, A, secret_msg)?);
        Ok(())
    }

    #[test]
    fn test_public_key_from_hex() -> anyhow::Result<()> {
        let pk = public_key_from_hex(
            "02c020067db727d586bc3183aecf97fcb800c3f4cc4759f69c626c9db5d8f5b5d4",
        )?;
        assert_eq!(
            pk.to_string(),
            "02c020067db727d586bc3183aecf97fcb800c3f4cc4759f69c626c9db5d8f5b5d4"
        );
        Ok(())
    }
}
