use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::cipher::{PublicKey, SecretKey, Signature};
use crate::dial::now_nanos;
use crate::util::buf::{BufExt, BufMutExt};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct ClientInfo {
    /// the servers the client holds sessions with, i.e. through which it can be reached
    pub delegated_servers: Vec<PublicKey>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServerInfo {
    /// network address clients dial, e.g. `1.2.3.4:8080`
    pub address: String,
    pub available_sessions: u32,
}

/// A signed discovery record. The sequence number increases with every update, and the signature
///  covers all other fields.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Entry {
    pub pk: PublicKey,
    pub sequence: u64,
    /// nanoseconds since the epoch
    pub timestamp: i64,
    pub client: Option<ClientInfo>,
    pub server: Option<ServerInfo>,
    pub signature: Signature,
}

impl Entry {
    pub fn new_client(pk: PublicKey, delegated_servers: Vec<PublicKey>) -> Entry {
        Entry {
            pk,
            sequence: 0,
            timestamp: now_nanos(),
            client: Some(ClientInfo { delegated_servers }),
            server: None,
            signature: Signature::NULL,
        }
    }

    pub fn new_server(pk: PublicKey, address: String, available_sessions: u32) -> Entry {
        Entry {
            pk,
            sequence: 0,
            timestamp: now_nanos(),
            client: None,
            server: Some(ServerInfo { address, available_sessions }),
            signature: Signature::NULL,
        }
    }

    fn ser_unsigned(&self, buf: &mut impl BufMut) {
        self.pk.ser(buf);
        buf.put_u64(self.sequence);
        buf.put_i64(self.timestamp);

        match &self.client {
            None => buf.put_u8(0),
            Some(client) => {
                buf.put_u8(1);
                buf.put_u16(client.delegated_servers.len().prechecked_cast());
                for pk in &client.delegated_servers {
                    pk.ser(buf);
                }
            }
        }
        match &self.server {
            None => buf.put_u8(0),
            Some(server) => {
                buf.put_u8(1);
                buf.put_u16_prefixed(server.address.as_bytes());
                buf.put_u32(server.available_sessions);
            }
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.ser_unsigned(buf);
        self.signature.ser(buf);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Entry> {
        let pk = PublicKey::try_deser(buf)?;
        let sequence = buf.try_get_u64()?;
        let timestamp = buf.try_get_i64()?;

        let client = match buf.try_get_u8()? {
            0 => None,
            1 => {
                let num: usize = buf.try_get_u16()?.safe_cast();
                let mut delegated_servers = Vec::with_capacity(num);
                for _ in 0..num {
                    delegated_servers.push(PublicKey::try_deser(buf)?);
                }
                Some(ClientInfo { delegated_servers })
            }
            other => bail!("invalid client flag {}", other),
        };
        let server = match buf.try_get_u8()? {
            0 => None,
            1 => {
                let address = String::from_utf8(buf.try_get_u16_prefixed()?.to_vec())?;
                let available_sessions = buf.try_get_u32()?;
                Some(ServerInfo { address, available_sessions })
            }
            other => bail!("invalid server flag {}", other),
        };
        let signature = Signature::try_deser(buf)?;

        Ok(Entry { pk, sequence, timestamp, client, server, signature })
    }

    fn unsigned_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.ser_unsigned(&mut buf);
        buf
    }

    pub fn sign(&mut self, sk: &SecretKey) {
        self.signature = sk.sign(&self.unsigned_bytes());
    }

    /// checks that the entry is signed by the key it describes
    pub fn verify(&self) -> anyhow::Result<()> {
        if self.pk.is_null() {
            bail!("entry has null public key");
        }
        self.pk.verify(&self.unsigned_bytes(), &self.signature)
    }

    pub fn delegated_servers(&self) -> &[PublicKey] {
        match &self.client {
            Some(client) => &client.delegated_servers,
            None => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::keys::{test_key_pair, test_pk};

    fn signed_client_entry() -> Entry {
        let (pk, sk) = test_key_pair(1);
        let mut entry = Entry::new_client(pk, vec![test_pk(7), test_pk(8)]);
        entry.sign(&sk);
        entry
    }

    #[test]
    fn test_ser() {
        let (pk, sk) = test_key_pair(2);
        let mut server = Entry::new_server(pk, "127.0.0.1:8080".to_string(), 99);
        server.sign(&sk);

        for entry in [signed_client_entry(), server] {
            let mut buf = BytesMut::new();
            entry.ser(&mut buf);
            let mut b: &[u8] = &buf;
            assert_eq!(Entry::try_deser(&mut b).unwrap(), entry);
            assert!(b.is_empty());
        }
    }

    #[test]
    fn test_verify() {
        let entry = signed_client_entry();
        entry.verify().unwrap();

        let mut tampered = entry.clone();
        tampered.sequence += 1;
        assert!(tampered.verify().is_err());

        let mut tampered = entry.clone();
        tampered.client = Some(ClientInfo { delegated_servers: vec![test_pk(9)] });
        assert!(tampered.verify().is_err());

        let mut resigned_by_other = entry;
        resigned_by_other.sign(&test_key_pair(3).1);
        assert!(resigned_by_other.verify().is_err());
    }

    #[test]
    fn test_delegated_servers() {
        assert_eq!(signed_client_entry().delegated_servers(), &[test_pk(7), test_pk(8)]);
        assert!(Entry::new_server(test_pk(1), "a".to_string(), 1).delegated_servers().is_empty());
    }
}
