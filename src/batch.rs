//! 批处理编排
//!
//! 每张图分配一个短 id，单图流水线丢进有界工作池（信号量 + `spawn_blocking`），
//! 全部完成后按输入顺序汇总。单图失败只影响它自己的结果条目。

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::error::BatchError;
use crate::pipeline::Pipeline;
use crate::report::AnalysisReport;

#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<AnalysisReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItemResult {
    fn succeeded(id: String, report: AnalysisReport) -> Self {
        Self { id, success: true, report: Some(report), error: None }
    }

    fn failed(id: String, error: String) -> Self {
        Self { id, success: false, report: None, error: Some(error) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub total_images: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// 与输入顺序一致
    pub results: Vec<BatchItemResult>,
}

pub struct BatchOrchestrator {
    pipeline: Arc<Pipeline>,
    /// 同一编排器的所有批次共享这组工位
    workers: Arc<Semaphore>,
    max_batch_size: usize,
}

impl BatchOrchestrator {
    pub fn new(pipeline: Arc<Pipeline>, workers: usize, max_batch_size: usize) -> Self {
        Self {
            pipeline,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            max_batch_size,
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// 提交一批已编码的图片。只有提交期校验会返回错误，单图失败写进对应条目。
    pub async fn process_batch(&self, images: Vec<Vec<u8>>) -> Result<BatchReport, BatchError> {
        if images.len() > self.max_batch_size {
            return Err(BatchError::TooManyImages { got: images.len(), max: self.max_batch_size });
        }

        let batch_id = short_id(6);
        info!(%batch_id, images = images.len(), "开始批处理");

        let mut pending = Vec::with_capacity(images.len());
        for bytes in images {
            let id = short_id(4);
            let pipeline = Arc::clone(&self.pipeline);
            let workers = Arc::clone(&self.workers);
            let item_id = id.clone();

            let handle = tokio::spawn(async move {
                let _permit = workers.acquire_owned().await.context("worker pool is shut down")?;
                let analysis =
                    tokio::task::spawn_blocking(move || pipeline.analyze_bytes(&item_id, &bytes)).await??;
                Ok::<_, anyhow::Error>(analysis)
            });
            pending.push((id, handle));
        }

        // 按提交顺序 join，结果与输入下标对应，与完成先后无关
        let mut results = Vec::with_capacity(pending.len());
        for (id, handle) in pending {
            let result = match handle.await {
                Ok(Ok(analysis)) => BatchItemResult::succeeded(id, analysis.report),
                Ok(Err(e)) => {
                    error!(%id, error = %format!("{e:#}"), "单图处理失败");
                    BatchItemResult::failed(id, format!("{e:#}"))
                }
                Err(e) => {
                    error!(%id, error = %e, "单图任务异常终止");
                    BatchItemResult::failed(id, format!("task aborted: {e}"))
                }
            };
            results.push(result);
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        let report = BatchReport {
            batch_id,
            total_images: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            results,
        };
        info!(
            batch_id = %report.batch_id,
            succeeded = report.succeeded,
            total = report.total_images,
            "批处理完成"
        );
        Ok(report)
    }

    /// 关闭工作池并释放流水线（及其持有的模型）
    pub fn shutdown(self) {
        self.workers.close();
        info!("批处理编排器已关闭");
    }
}

/// `bytes` 个随机字节的十六进制串
fn short_id(bytes: usize) -> String {
    let raw: Vec<u8> = (0..bytes).map(|_| rand::random::<u8>()).collect();
    hex::encode(raw)
}
