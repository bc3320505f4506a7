//! Cipher pipeline orchestrator
//!
//! Per-tunnel bundle of the three transformation stages. Egress runs
//! protocol → cipher → obfs; ingress runs the inverse, and may additionally
//! yield a feedback buffer that must be written back to the upstream socket
//! before further reads.

use crate::buffer::{Buffer, SSR_BUFF_SIZE};
use crate::crypto::{DecryptCtx, EncryptCtx};
use crate::error::{Result, TunnelError};
use crate::plugin::{
    create_obfs, create_protocol, ObfsPlugin, ProtocolPlugin, ServerInfo, TCP_MSS,
};
use crate::server::env::ServerEnv;
use crate::socks5::ss_head_len;

/// The three-stage encrypt/decrypt pipeline of one tunnel.
pub struct CipherPipeline {
    enc: Option<EncryptCtx>,
    dec: Option<DecryptCtx>,
    protocol: Box<dyn ProtocolPlugin>,
    obfs: Box<dyn ObfsPlugin>,
}

impl CipherPipeline {
    /// Build the pipeline for a new tunnel. `init_package` is the shadowsocks
    /// address header; its layout determines `head_len` for the plugins.
    pub fn new(env: &ServerEnv, init_package: &[u8]) -> Result<Self> {
        let cipher = &env.cipher;
        // Contexts exist only for real ciphers; `none` runs bare.
        let (enc, dec) = if cipher.method.needs_contexts() {
            (Some(EncryptCtx::new(cipher)?), Some(DecryptCtx::new(cipher)))
        } else {
            (None, None)
        };

        let mut protocol = create_protocol(&env.config.server.protocol)
            .expect("protocol name validated at startup");
        let mut obfs =
            create_obfs(&env.config.server.obfs).expect("obfs name validated at startup");

        let overhead = protocol.overhead() + obfs.overhead();
        let info = ServerInfo {
            host: env.config.server.remote_host.clone(),
            port: env.config.server.remote_port,
            iv: enc.as_ref().map(|e| e.iv().to_vec()).unwrap_or_default(),
            key: cipher.key.clone(),
            param: env.config.server.protocol_param.clone(),
            g_data: env.protocol_global.clone(),
            tcp_mss: TCP_MSS,
            buffer_size: SSR_BUFF_SIZE,
            overhead,
            head_len: ss_head_len(init_package, 30),
        };
        protocol.set_server_info(&info);

        let obfs_info = ServerInfo {
            param: env.config.server.obfs_param.clone(),
            ..info
        };
        obfs.set_server_info(&obfs_info);

        Ok(Self::from_parts(enc, dec, protocol, obfs))
    }

    fn from_parts(
        enc: Option<EncryptCtx>,
        dec: Option<DecryptCtx>,
        protocol: Box<dyn ProtocolPlugin>,
        obfs: Box<dyn ObfsPlugin>,
    ) -> Self {
        Self {
            enc,
            dec,
            protocol,
            obfs,
        }
    }

    /// Egress: plaintext from the client into wire bytes for the upstream.
    pub fn encrypt(&mut self, data: &[u8]) -> Result<Buffer> {
        let framed = self.protocol.client_pre_encrypt(data)?;
        let ciphered = match self.enc.as_mut() {
            Some(enc) => enc.encrypt(&framed),
            None => framed,
        };
        self.obfs.client_encode(&ciphered)
    }

    /// Ingress: wire bytes from the upstream into plaintext for the client,
    /// plus an optional feedback buffer to send back upstream.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<(Buffer, Option<Buffer>)> {
        let decoded = self.obfs.client_decode(data)?;

        let feedback = if decoded.need_sendback {
            Some(self.obfs.client_encode(&[])?)
        } else {
            None
        };

        if decoded.data.is_empty() {
            return Ok((Buffer::new(), feedback));
        }

        let plain = match self.dec.as_mut() {
            Some(dec) => dec.decrypt(&decoded.data)?,
            None => decoded.data,
        };
        if plain.is_empty() {
            // Still inside the peer's IV; nothing to hand to the protocol.
            return Ok((Buffer::new(), feedback));
        }

        let out = self.protocol.client_post_decrypt(&plain)?;
        Ok((out, feedback))
    }
}
