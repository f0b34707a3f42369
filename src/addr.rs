use std::fmt::{Debug, Display, Formatter};

use bytes::{Buf, BufMut};

use crate::cipher::PublicKey;

/// A logical endpoint in the overlay network: a client's public key and a port on that client.
///  Port 0 is reserved and means 'no specific port'.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct Addr {
    pub pk: PublicKey,
    pub port: u16,
}

impl Addr {
    pub const SERIALIZED_LEN: usize = 34;

    pub fn new(pk: PublicKey, port: u16) -> Addr {
        Addr { pk, port }
    }

    pub fn short(&self) -> String {
        format!("{}:{}", self.pk.short(), self.port_str())
    }

    fn port_str(&self) -> String {
        match self.port {
            0 => "~".to_string(),
            p => p.to_string(),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.pk.ser(buf);
        buf.put_u16(self.port);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Addr> {
        let pk = PublicKey::try_deser(buf)?;
        let port = buf.try_get_u16()?;
        Ok(Addr { pk, port })
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.pk, self.port_str())
    }
}

impl Debug for Addr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Addr({})", self.short())
    }
}
