//! ABI encoding for constructor arguments and the factory entry point.

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue},
    primitives::{Address, Bytes, keccak256},
};
use serde::{Deserialize, Serialize};

/// Signature of the factory entry point that creates a plugin repo with its first version.
pub const CREATE_REPO_SIGNATURE: &str =
    "createPluginRepoWithFirstVersion(string,address,address,bytes,bytes)";

/// One constructor argument as written in configuration, e.g. `{ type = "uint256", value = "10000000" }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AbiArg {
    #[serde(rename = "type")]
    pub ty: String,
    pub value: String,
}

impl AbiArg {
    pub fn new(ty: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            value: value.into(),
        }
    }
}

/// ABI-encode constructor arguments, ready to be appended to creation bytecode.
///
/// An empty argument list encodes to no bytes.
pub fn encode_constructor_args(args: &[AbiArg]) -> Result<Vec<u8>, alloy_core::dyn_abi::Error> {
    if args.is_empty() {
        return Ok(Vec::new());
    }

    let values = args
        .iter()
        .map(|arg| DynSolType::parse(&arg.ty)?.coerce_str(&arg.value))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DynSolValue::Tuple(values).abi_encode_params())
}

/// The 4-byte selector of a function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Decode call output holding a single `address`. `None` when the output is too short or
/// the word is not a padded address, as when the callee has no code.
pub fn decode_address(output: &[u8]) -> Option<Address> {
    let word = output.get(..32)?;
    if word[..12].iter().any(|byte| *byte != 0) {
        return None;
    }
    Some(Address::from_slice(&word[12..]))
}

/// Calldata for `createPluginRepoWithFirstVersion`.
pub fn encode_create_repo_call(
    repo_name: &str,
    plugin_setup: Address,
    maintainer: Address,
    release_metadata: &[u8],
    build_metadata: &[u8],
) -> Bytes {
    let params = DynSolValue::Tuple(vec![
        DynSolValue::String(repo_name.to_string()),
        DynSolValue::Address(plugin_setup),
        DynSolValue::Address(maintainer),
        DynSolValue::Bytes(release_metadata.to_vec()),
        DynSolValue::Bytes(build_metadata.to_vec()),
    ])
    .abi_encode_params();

    let mut calldata = selector(CREATE_REPO_SIGNATURE).to_vec();
    calldata.extend_from_slice(&params);
    Bytes::from(calldata)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(data: &[u8], index: usize) -> &[u8] {
        &data[index * 32..(index + 1) * 32]
    }

    #[test]
    fn test_selector_of_known_function() {
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
    }

    #[test]
    fn test_encode_uint_constructor_arg() {
        let encoded = encode_constructor_args(&[AbiArg::new("uint256", "10000000")])
            .expect("valid argument");

        assert_eq!(encoded.len(), 32);
        assert_eq!(
            hex::encode(&encoded),
            "0000000000000000000000000000000000000000000000000000000000989680"
        );
    }

    #[test]
    fn test_encode_no_constructor_args() {
        assert!(encode_constructor_args(&[]).expect("empty").is_empty());
    }

    #[test]
    fn test_encode_invalid_constructor_arg() {
        assert!(encode_constructor_args(&[AbiArg::new("uint256", "not-a-number")]).is_err());
        assert!(encode_constructor_args(&[AbiArg::new("uint257", "1")]).is_err());
    }

    #[test]
    fn test_encode_create_repo_call_layout() {
        let setup = Address::repeat_byte(0x11);
        let maintainer = Address::repeat_byte(0x22);
        let release = b"ipfs://QmRelease";
        let build = b"ipfs://QmBuild";

        let calldata = encode_create_repo_call("veto-plugin", setup, maintainer, release, build);

        assert_eq!(calldata[..4], selector(CREATE_REPO_SIGNATURE));

        let params = &calldata[4..];
        // Five head words, then one length word plus one padded data word per dynamic value.
        assert_eq!(params.len(), 5 * 32 + 3 * 64);

        // First dynamic value starts right after the head.
        assert_eq!(word(params, 0)[31], 0xa0);
        assert_eq!(&word(params, 1)[12..], setup.as_slice());
        assert_eq!(&word(params, 2)[12..], maintainer.as_slice());

        // Repo name tail: length then UTF-8 data.
        assert_eq!(word(params, 5)[31], "veto-plugin".len() as u8);
        assert_eq!(&word(params, 6)[..11], b"veto-plugin");
    }

    #[test]
    fn test_decode_address_output() {
        let repo = Address::repeat_byte(0x7e);
        let mut output = vec![0u8; 12];
        output.extend_from_slice(repo.as_slice());

        assert_eq!(decode_address(&output), Some(repo));
        // A call to an address without code returns nothing.
        assert_eq!(decode_address(&[]), None);
        assert_eq!(decode_address(&[0xff; 32]), None);
    }
}
