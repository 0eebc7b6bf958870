//! Higher-level disk operations on top of the RPC gateway.

use crate::error::{ExportError, PlatformContext, Result};
use crate::platform::gateway::{RawImportRequest, RpcGateway};
use crate::platform::types::{keys, VdiFormat, VdiRef};
use crate::stream::ByteStream;
use tracing::warn;

/// Disk operations that need more than one gateway call.
pub struct VdiOps<'a> {
    gateway: &'a dyn RpcGateway,
}

impl<'a> VdiOps<'a> {
    pub fn new(gateway: &'a dyn RpcGateway) -> Self {
        Self { gateway }
    }

    /// Destroy a disk. A "handle invalid" failure means the disk is
    /// already gone and is treated as success.
    pub async fn destroy(&self, vdi: &VdiRef) -> Result<()> {
        match self.gateway.destroy_vdi(vdi).await {
            Err(err) if err.is_handle_invalid() => Ok(()),
            other => other,
        }
    }

    /// Import disk content through the bulk resource endpoint.
    ///
    /// The expected content length and the import task are recorded in the
    /// disk's metadata before the transfer and cleared afterwards; clearing
    /// is best-effort and never fails the import.
    pub async fn import_content(
        &self,
        vdi: &VdiRef,
        format: VdiFormat,
        length: u64,
        content: ByteStream,
    ) -> Result<()> {
        let record = self.gateway.vdi_record(vdi).await?;
        let sr = self.gateway.sr_record(&record.sr).await?;
        let task = self
            .gateway
            .create_task(&format!(
                "Importing content into VDI {} on SR {}",
                record.name_label, sr.name_label
            ))
            .await?;

        self.gateway
            .update_vdi_other_config(vdi, keys::IMPORT_TASK, Some(task.as_str()))
            .await?;
        self.gateway
            .update_vdi_other_config(vdi, keys::IMPORT_LENGTH, Some(&length.to_string()))
            .await?;

        let result = self
            .gateway
            .import_raw_vdi(
                RawImportRequest {
                    format,
                    vdi: vdi.clone(),
                    task,
                },
                content,
            )
            .await;

        for key in [keys::IMPORT_TASK, keys::IMPORT_LENGTH] {
            if let Err(err) = self.gateway.update_vdi_other_config(vdi, key, None).await {
                warn!(vdi = %vdi, key, %err, "failed to clear import marker");
            }
        }

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                let mut context = PlatformContext {
                    sr: Some(sr),
                    vdi: Some(record),
                    ..Default::default()
                };
                if let Ok(master) = self.gateway.pool_master().await {
                    context.pool_master = self.gateway.host_record(&master).await.ok();
                }
                Err(ExportError::ExportConstruction {
                    context: Box::new(context),
                    source: Box::new(err),
                })
            }
        }
    }
}
