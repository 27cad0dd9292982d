//! 投递引擎（PublishEngine）
//!
//! 统一编排两类长驻任务：
//! - 确认消费：从确认通道读取 Broker 回传，并发交给投递适配器对账；
//! - 补偿扫描：按配置间隔周期执行 `RecoveryScanner::scan_once`。
//!
//! 关闭通过 `EngineHandle` 完成，句柄被丢弃时同样会触发关闭。
//!
use crate::broker::{AckReceiver, AckOutcome, BrokerPublisher};
use crate::error::{DomainError, DomainResult as Result};
use crate::recovery::RecoveryScanner;
use bon::Builder;
use futures_util::StreamExt;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Builder)]
pub struct PublishEngine {
    publisher: Arc<BrokerPublisher>,
    scanner: Arc<RecoveryScanner>,
    #[builder(default)]
    config: EngineConfig,
}

impl PublishEngine {
    /// 订阅确认通道并启动引擎；配置非法时不启动任何任务
    pub fn start(self: Arc<Self>) -> Result<EngineHandle> {
        self.validate()?;
        let acks = self.publisher.subscribe_acks(self.config.ack_buffer);
        self.start_with(acks)
    }

    /// 使用外部提供的确认接收端启动引擎
    pub fn start_with(self: Arc<Self>, acks: AckReceiver) -> Result<EngineHandle> {
        self.validate()?;
        let token = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(2);

        // recovery worker（周期任务）
        {
            let scanner = self.scanner.clone();
            let interval = scanner.config().interval;

            tasks.push(Self::spawn_periodic(token.clone(), interval, move || {
                let scanner = scanner.clone();
                async move {
                    scanner.scan_once().await;
                }
            }));
        }

        // ack worker（长循环）
        tasks.push(tokio::spawn(Self::ack_loop(self.clone(), acks, token.clone())));

        info!(
            ack_concurrency = self.config.ack_concurrency,
            scan_interval_ms = self.scanner.config().interval.as_millis() as u64,
            "publish engine started"
        );
        Ok(EngineHandle { token, tasks })
    }

    fn validate(&self) -> Result<()> {
        self.config.validate()?;
        self.scanner.config().validate()
    }

    fn spawn_periodic<F, Fut>(
        token: CancellationToken,
        interval: Duration,
        mut f: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // 首个 tick 立即完成，跳过以免启动即扫描
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => f().await,
                }
            }
        })
    }

    async fn ack_loop(self: Arc<Self>, acks: AckReceiver, token: CancellationToken) {
        let publisher = self.publisher.clone();
        let concurrency = self.config.ack_concurrency;

        let consume = acks
            .into_stream()
            .for_each_concurrent(Some(concurrency), move |ack| {
                let publisher = publisher.clone();
                async move {
                    let token = ack.token.clone();
                    match publisher.on_ack(ack).await {
                        Ok(AckOutcome::Unmatched) => {}
                        Ok(outcome) => debug!(token = %token, ?outcome, "ack reconciled"),
                        Err(err) => warn!(token = %token, error = %err, "ack handling failed"),
                    }
                }
            });

        tokio::select! {
            _ = token.cancelled() => {}
            _ = consume => {
                debug!("ack channel closed");
            }
        }
    }
}

/// 引擎配置
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 同时处理的确认数
    pub ack_concurrency: usize,
    /// 确认通道容量
    pub ack_buffer: usize,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ack_concurrency == 0 {
            return Err(DomainError::invalid_value("ack_concurrency must be positive"));
        }
        if self.ack_buffer == 0 {
            return Err(DomainError::invalid_value("ack_buffer must be positive"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ack_concurrency: 8,
            ack_buffer: 256,
        }
    }
}

/// 引擎运行句柄：用于优雅关闭与等待任务结束
pub struct EngineHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// 等待全部任务结束；任一任务 panic 时记录日志并返回首个错误
    pub async fn join(mut self) -> std::result::Result<(), JoinError> {
        let tasks = std::mem::take(&mut self.tasks);
        let mut first = None;

        for t in tasks {
            if let Err(err) = t.await {
                error!(error = %err, "engine task terminated abnormally");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
